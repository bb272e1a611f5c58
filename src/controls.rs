//! Line commands read from stdin, the native stand-in for the page's mode
//! radio buttons, skeleton checkbox and window events.

use crate::controller::ControlEvent;
use crate::inference::Mode;
use anyhow::{anyhow, bail, Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const HELP: &str = "commands: detect|d, segment|s, skeleton on|off, resize <width>, rotate <width>, quit|q";

/// Parses one command line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Result<Option<ControlEvent>> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Ok(None);
    };
    let argument = words.next();
    if let Some(extra) = words.next() {
        bail!("unexpected argument '{}'", extra);
    }

    let event = match (command.to_ascii_lowercase().as_str(), argument) {
        ("detect" | "d", None) => ControlEvent::SelectMode(Mode::Detection),
        ("segment" | "s", None) => ControlEvent::SelectMode(Mode::Segmentation),
        ("skeleton", Some(state)) => ControlEvent::SetSkeleton(parse_switch(state)?),
        ("resize", Some(width)) => ControlEvent::Resize {
            container_width: parse_width(width)?,
        },
        ("rotate", Some(width)) => ControlEvent::OrientationChanged {
            container_width: parse_width(width)?,
        },
        ("quit" | "q", None) => ControlEvent::Shutdown,
        (other, _) => bail!("unknown command '{}'", other),
    };
    Ok(Some(event))
}

fn parse_switch(state: &str) -> Result<bool> {
    match state.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        other => Err(anyhow!("expected on or off, got '{}'", other)),
    }
}

fn parse_width(width: &str) -> Result<u32> {
    let width: u32 = width
        .parse()
        .with_context(|| format!("invalid width '{}'", width))?;
    if width == 0 {
        bail!("width must be positive");
    }
    Ok(width)
}

/// Forwards parsed commands until input ends, `quit` is read or the
/// controller goes away. Bad lines are logged and skipped.
pub async fn forward_commands<R>(reader: R, events: mpsc::Sender<ControlEvent>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await.context("Failed to read command")? {
        let event = match parse_command(&line) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(err) => {
                tracing::warn!("{:#} ({})", err, HELP);
                continue;
            }
        };

        let quit = matches!(event, ControlEvent::Shutdown);
        if events.send(event).await.is_err() {
            tracing::debug!("Controller gone; ignoring further commands");
            return Ok(());
        }
        if quit {
            return Ok(());
        }
    }
    tracing::debug!("Command input closed");
    Ok(())
}

pub fn spawn_stdin_controls(events: mpsc::Sender<ControlEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("{}", HELP);
        if let Err(err) = forward_commands(BufReader::new(tokio::io::stdin()), events).await {
            tracing::warn!("Stopped reading commands: {:#}", err);
        }
    })
}
