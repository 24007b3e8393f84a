use std::time::Duration;

use futures_util::StreamExt;
use hubwire::prelude::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Commands typed at the prompt
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum Command {
    /// `hello` → SendMessage("hello")
    Say(String),
    /// `/echo hello` → invoke Echo("hello")
    Echo(String),
    /// `/count 5` → stream Counter(5, 100)
    Count(u32),
    /// `/upload a b c` → client stream to UploadStream
    Upload(Vec<String>),
    Quit,
}

fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        if line.is_empty() {
            return Err("nothing to send".into());
        }
        return Ok(Command::Say(line.to_string()));
    };
    let (name, args) = rest.split_once(' ').unwrap_or((rest, ""));
    let args = args.trim();
    match name {
        "echo" => Ok(Command::Echo(args.to_string())),
        "count" => args
            .parse()
            .map(Command::Count)
            .map_err(|_| "usage: /count <n>".to_string()),
        "upload" if !args.is_empty() => Ok(Command::Upload(
            args.split_whitespace().map(str::to_string).collect(),
        )),
        "upload" => Err("usage: /upload <word>...".into()),
        "quit" | "exit" => Ok(Command::Quit),
        other => Err(format!("unknown command /{other}")),
    }
}

// ---------------------------------------------------------------------------
// Running commands against the hub
// ---------------------------------------------------------------------------

async fn run_command(connection: &HubConnection, command: Command) -> Result<(), HubError> {
    match command {
        Command::Say(text) => {
            connection.send("SendMessage", vec![json!("me"), json!(text)]).await?;
        }
        Command::Echo(text) => {
            let reply: String = connection.invoke_as("Echo", vec![json!(text)]).await?;
            println!("echo: {reply}");
        }
        Command::Count(n) => {
            let mut counter = connection.stream("Counter", vec![json!(n), json!(100)]).await?;
            while let Some(item) = counter.next().await {
                println!("count: {}", item?);
            }
        }
        Command::Upload(words) => {
            let upload = Subject::new();
            connection
                .send_with_streams("UploadStream", vec![], vec![upload.clone()])
                .await?;
            for word in words {
                upload.next(json!(word));
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            upload.complete();
        }
        Command::Quit => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "http://localhost:5000/default".to_string());
    eprintln!("connecting to {url}");

    let connection = HubConnectionBuilder::new()
        .with_url(url)
        .with_automatic_reconnect()
        .build()?;

    connection.on("ReceiveMessage", |args| match args.as_slice() {
        [user, message] => println!("{user}: {message}"),
        _ => println!("message: {args:?}"),
    });
    connection.on_reconnecting(|error| eprintln!("reconnecting: {error:?}"));
    connection.on_reconnected(|id| eprintln!("reconnected as {id:?}"));
    connection.on_close(|error| eprintln!("closed: {error:?}"));

    connection.start().await?;
    eprintln!(
        "connected ({}), type a message or /echo, /count, /upload, /quit",
        connection.connection_id().unwrap_or_default()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_command(&line) {
            Ok(Command::Quit) => break,
            Ok(command) => {
                if let Err(error) = run_command(&connection, command).await {
                    eprintln!("error: {error}");
                }
            }
            Err(usage) => eprintln!("{usage}"),
        }
    }

    connection.stop().await;
    Ok(())
}
