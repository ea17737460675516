//! Minimal terminal client: stdin lines go to the relay, relay lines go to
//! stdout.

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::cli::ClientArgs;

pub async fn run(args: ClientArgs) -> Result<()> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    info!("connected to {}", args.server);

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut stdin = BufReader::new(tokio::io::stdin());

    run_client_loop(&mut reader, &mut writer, &mut stdin).await?;

    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
    Ok(())
}

async fn run_client_loop(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut BufReader<tokio::io::Stdin>,
) -> Result<()> {
    // read_until keeps partial lines in the buffer when the other branch wins
    let mut incoming = Vec::new();
    let mut input = Vec::new();

    loop {
        select! {
            read = reader.read_until(b'\n', &mut incoming) => {
                if read? == 0 {
                    write_stdout("*** relay closed the connection").await?;
                    break;
                }
                write_stdout(&String::from_utf8_lossy(trim_line(&incoming))).await?;
                incoming.clear();
            }
            read = stdin.read_until(b'\n', &mut input) => {
                if read? == 0 || !handle_stdin_input(trim_line(&input), writer).await? {
                    break;
                }
                input.clear();
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

fn trim_line(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|byte| !matches!(byte, b'\r' | b'\n'))
        .map_or(0, |last| last + 1);
    &bytes[..end]
}

async fn handle_stdin_input(text: &[u8], writer: &mut OwnedWriteHalf) -> Result<bool> {
    if text.eq_ignore_ascii_case(b"/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    let mut line = Vec::with_capacity(text.len() + 1);
    line.extend_from_slice(text);
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(true)
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
