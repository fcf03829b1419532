use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    select,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    protocol::{read_line, write_line},
    record::Record,
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(&args).await?;
    write_stdout(&format!("*** connected to {}", args.server)).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(&mut reader, &mut writer, &mut stdin, &mut input).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(
    args: &ClientArgs,
) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

async fn run_client_loop(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            server_line = read_line(reader) => {
                if !handle_server_line(server_line).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_line(line: io::Result<Option<String>>) -> Result<bool> {
    match line? {
        Some(line) => {
            write_stdout(&render_server_line(&line)).await?;
            Ok(true)
        }
        None => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
    }
}

/// What to send for one line of terminal input.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Quit,
    Skip,
    Send(String),
}

fn interpret_input(text: &str) -> Input {
    let text = text.trim();
    if text.is_empty() {
        return Input::Skip;
    }
    if text.eq_ignore_ascii_case("/quit") {
        return Input::Quit;
    }
    match text.strip_prefix("/retrieve") {
        Some(id) => Input::Send(format!("retrieve:{}", id.trim())),
        None => Input::Send(text.to_string()),
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    writer: &mut OwnedWriteHalf,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    match interpret_input(input) {
        Input::Skip => Ok(true),
        Input::Quit => {
            write_stdout("*** leaving relay").await?;
            Ok(false)
        }
        Input::Send(line) => {
            write_line(writer, &line).await?;
            Ok(true)
        }
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

/// Records are shown as `[<short hash>] <message>`; anything else the relay
/// sends (e.g. "Block not found") is shown as is.
fn render_server_line(line: &str) -> String {
    match Record::from_line(line) {
        Ok(record) => format!("[{}] {}", record.short_hash(), record.message),
        Err(_) => line.to_string(),
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
