//! Thin terminal client: stdin lines go to the server, server lines go to
//! stdout.

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    protocol::{DEFAULT_MAX_LINE_LENGTH, read_line, write_line},
};

/// Why the client session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// The server closed the stream or the connection failed.
    ServerClosed,
    /// Stdin reached end of file or Ctrl-C was pressed.
    LocalQuit,
}

pub async fn run(args: ClientArgs) -> Result<Disconnect> {
    let (reader, mut writer) = establish_connection(&args).await?;
    write_stdout("Connected to chat server. Type a message and press Enter.").await?;

    let mut server_lines = tokio::spawn(print_server_lines(reader));
    let mut stdin = BufReader::new(tokio::io::stdin());

    let outcome = run_client_loop(&mut server_lines, &mut writer, &mut stdin).await?;
    if outcome == Disconnect::ServerClosed {
        write_stdout("Disconnected from server.").await?;
    } else {
        shutdown_connection(&mut writer).await;
        server_lines.abort();
    }

    Ok(outcome)
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
    server_lines: &mut JoinHandle<io::Result<()>>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut BufReader<tokio::io::Stdin>,
) -> Result<Disconnect> {
    let mut input = String::new();
    loop {
        input.clear();
        select! {
            printed = &mut *server_lines => {
                match printed {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => warn!(?error, "lost connection to server"),
                    Err(error) => warn!(?error, "server reader task failed"),
                }
                return Ok(Disconnect::ServerClosed);
            }
            bytes_read = stdin.read_line(&mut input) => {
                if !handle_stdin_input(bytes_read, &input, writer).await? {
                    return Ok(Disconnect::LocalQuit);
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                return Ok(Disconnect::LocalQuit);
            }
        }
    }
}

/// Prints every line from the server until it closes the stream.
async fn print_server_lines(mut reader: BufReader<OwnedReadHalf>) -> io::Result<()> {
    while let Some(line) = read_line(&mut reader, DEFAULT_MAX_LINE_LENGTH).await? {
        write_stdout(&line).await?;
    }
    debug!("server closed the connection");
    Ok(())
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    writer: &mut OwnedWriteHalf,
) -> Result<bool> {
    if bytes_read? == 0 {
        return Ok(false);
    }

    let text = input.trim_end_matches(['\n', '\r']);
    write_line(writer, text)
        .await
        .context("failed to send line to server")?;
    Ok(true)
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

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
