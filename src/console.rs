//! Interactive operator console for `dfs client`

use std::error::Error;
use std::io::{self, Write};

use dfs_core::{ClientConfig, ClientError, ClientSession, Credentials};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    List,
    Get(String),
    Put(String),
}

impl ConsoleCommand {
    /// `list`, `get <file>` or `put <file>`; anything else is `None`
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (command, argument) = match line.split_once(' ') {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };

        match (command, argument) {
            ("list", _) => Some(ConsoleCommand::List),
            ("get", file) if !file.is_empty() => Some(ConsoleCommand::Get(file.to_string())),
            ("put", file) if !file.is_empty() => Some(ConsoleCommand::Put(file.to_string())),
            _ => None,
        }
    }
}

pub struct Console<R, W> {
    lines: Lines<R>,
    out: W,
}

impl<R, W> Console<R, W>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    pub fn new(input: R, out: W) -> Self {
        Self {
            lines: input.lines(),
            out,
        }
    }

    async fn prompt(&mut self, text: &str) -> io::Result<Option<String>> {
        writeln!(self.out, "{}", text)?;
        self.out.flush()?;
        self.lines.next_line().await
    }

    /// Ask for credentials until they match; `None` if input ends first
    pub async fn login(&mut self, credentials: &Credentials) -> io::Result<Option<String>> {
        loop {
            let Some(line) = self.prompt("Input username & password: ").await? else {
                return Ok(None);
            };
            let line = line.trim_end_matches('\r');
            let (username, password) = line.split_once(' ').unwrap_or((line, ""));

            if credentials.authenticate(username, password) {
                writeln!(self.out, "Login successful!")?;
                return Ok(Some(username.to_string()));
            }
            writeln!(self.out, "Username & password combination not found!")?;
        }
    }

    /// Read and execute commands until input ends
    pub async fn run(&mut self, session: &mut ClientSession) -> io::Result<()> {
        while let Some(line) = self.prompt("\nInput command: ").await? {
            match ConsoleCommand::parse(&line) {
                Some(command) => self.execute(session, command).await?,
                None => writeln!(self.out, "Invalid input. Try list, put, or get")?,
            }
        }
        Ok(())
    }

    async fn execute(&mut self, session: &mut ClientSession, command: ConsoleCommand) -> io::Result<()> {
        match command {
            ConsoleCommand::List => {
                let listing = session.list().await;
                writeln!(self.out, "Directory Items:")?;
                for item in listing {
                    writeln!(self.out, "{}", item)?;
                }
            }
            ConsoleCommand::Get(filename) => match session.get(&filename).await {
                Ok(_) => writeln!(self.out, "File written!")?,
                Err(ClientError::Aggregate(dfs_core::AggregateError::NotFound(_))) => {
                    writeln!(self.out, "File not found!")?
                }
                Err(ClientError::Aggregate(dfs_core::AggregateError::MissingParts { .. })) => {
                    writeln!(self.out, "Parts of file are missing!")?
                }
                Err(e) => writeln!(self.out, "Error: {}", e)?,
            },
            ConsoleCommand::Put(path) => match session.put(&path).await {
                Ok(report) => {
                    writeln!(
                        self.out,
                        "File uploaded to {} node(s)",
                        report.stored_on.len()
                    )?;
                    if !report.uncovered.is_empty() {
                        writeln!(self.out, "Parts of file are missing!")?;
                    }
                }
                Err(ClientError::ReadSource { .. }) => writeln!(self.out, "Error opening file!")?,
                Err(e) => writeln!(self.out, "Error: {}", e)?,
            },
        }
        self.out.flush()
    }
}

/// Log in on stdin/stdout and serve commands until stdin closes
pub async fn run_client(config: ClientConfig) -> Result<(), Box<dyn Error>> {
    let credentials = Credentials::load(&config.credentials_file)?;
    let registry = config.registry()?;

    let mut console = Console::new(BufReader::new(tokio::io::stdin()), io::stdout());
    let Some(username) = console.login(&credentials).await? else {
        return Ok(());
    };
    info!(user = %username, "Logged in");

    let mut session = ClientSession::new(registry, username, config.session_settings());
    console.run(&mut session).await?;
    Ok(())
}
