mod cli;
mod logging;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use quiz_link::{
    EnqueueOutcome, HttpSignalingRelay, LinkConfig, LinkEvent, LinkHandle, OutboundMessage,
    PeerLink, Role, RtcConfig, RtcPeer,
};

use cli::{Cli, Command};

/// One line of operator input.
#[derive(Debug, PartialEq)]
enum InputLine {
    Answer { quiz_id: String, text: String },
    Message(String),
}

fn parse_line(line: &str) -> Option<InputLine> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if let Some(rest) = line.strip_prefix("answer ") {
        let mut parts = rest.trim_start().splitn(2, char::is_whitespace);
        if let (Some(quiz_id), Some(text)) = (parts.next(), parts.next()) {
            return Some(InputLine::Answer {
                quiz_id: quiz_id.to_string(),
                text: text.trim().to_string(),
            });
        }
    }
    Some(InputLine::Message(line.to_string()))
}

async fn dispatch(handle: &LinkHandle, role: Role, input: InputLine) -> Result<()> {
    let outcome = match (role, input) {
        (Role::Participant, InputLine::Answer { quiz_id, text }) => handle
            .send_answer(quiz_id.clone(), json!({ "quizId": quiz_id, "answer": text }))
            .await
            .context("sending answer")?,
        (Role::Creator, InputLine::Answer { quiz_id, text }) => handle
            .send(OutboundMessage::new(
                "quiz",
                json!({ "quizId": quiz_id, "question": text }),
            ))
            .await
            .context("sending quiz")?,
        (Role::Creator, InputLine::Message(text)) => handle
            .send(OutboundMessage::new("quiz", json!({ "question": text })))
            .await
            .context("sending quiz")?,
        (Role::Participant, InputLine::Message(text)) => handle
            .send(OutboundMessage::new("chat", json!({ "text": text })))
            .await
            .context("sending chat")?,
    };
    match outcome {
        EnqueueOutcome::AlreadyComplete => eprintln!("already answered; ignoring"),
        EnqueueOutcome::AnswerInFlight(_) => eprintln!("answer already sent; awaiting ack"),
        EnqueueOutcome::Queued(_) => {}
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let relay = Arc::new(
        HttpSignalingRelay::new(&cli.relay)
            .with_context(|| format!("invalid relay url {}", cli.relay))?,
    );
    let (peer, peer_events) = RtcPeer::new(RtcConfig::from_env())
        .await
        .context("creating WebRTC peer")?;
    let config = LinkConfig::from_env();

    let (mut link, role) = match cli.command {
        Command::Host => {
            let link = PeerLink::create(config, relay, peer, peer_events)
                .await
                .context("creating session")?;
            println!("session id: {}", link.session_id());
            (link, Role::Creator)
        }
        Command::Join(args) => {
            let link = PeerLink::join(config, relay, peer, peer_events, args.session_id)
                .await
                .context("joining session")?;
            (link, Role::Participant)
        }
    };

    eprintln!("waiting for peer...");
    link.wait_until_open()
        .await
        .context("data channel never opened")?;
    eprintln!("connected; type a line to send it (answer <quiz-id> <text> for answers)");

    let handle = link.handle();
    let mut status = link.subscribe_status();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("reading stdin")? {
                    Some(line) => {
                        if let Some(input) = parse_line(&line) {
                            dispatch(&handle, role, input).await?;
                        }
                    }
                    None => break,
                }
            }
            event = link.next_event() => {
                match event {
                    Some(LinkEvent::Message(envelope)) => {
                        println!("<- [{}] {}", envelope.kind, envelope.payload);
                    }
                    Some(LinkEvent::Delivery(event)) => {
                        info!(target = "quizlink", ?event, "delivery");
                    }
                    None => break,
                }
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                info!(
                    target = "quizlink",
                    connection = ?current.connection,
                    channel = ?current.channel,
                    liveness = ?current.liveness,
                    "link status"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                warn!(target = "quizlink", "interrupted");
                break;
            }
        }
    }

    link.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).context("initializing logging")?;
    run(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answer_lines_carry_quiz_id() {
        assert_eq!(
            parse_line("answer q7  Paris is the capital "),
            Some(InputLine::Answer {
                quiz_id: "q7".into(),
                text: "Paris is the capital".into(),
            })
        );
    }

    #[test]
    fn other_lines_are_plain_messages() {
        assert_eq!(parse_line("   "), None);
        assert_eq!(
            parse_line("answer"),
            Some(InputLine::Message("answer".into()))
        );
        assert_eq!(
            parse_line("answer q1"),
            Some(InputLine::Message("answer q1".into()))
        );
        assert_eq!(
            parse_line("hello there"),
            Some(InputLine::Message("hello there".into()))
        );
    }
}
