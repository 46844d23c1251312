//! Interactive terminal client: stdin lines go to the hub, broadcasts go to
//! stdout.

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    message::{ChatMessage, write_message},
};

/// Whatever woke the client up.
enum Event {
    Broadcast(ChatMessage),
    BlankLine,
    HubHungUp,
    Typed(String),
    InputClosed,
    Interrupted,
}

/// What the client does about a typed line.
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Nothing,
    Leave,
    Say(&'a str),
}

struct Session {
    name: String,
    // Line readers keep partial input across select! iterations.
    from_hub: Lines<BufReader<OwnedReadHalf>>,
    to_hub: OwnedWriteHalf,
    stdin: Lines<BufReader<Stdin>>,
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    info!(server = %args.server, name = %args.name, "connected to hub");

    let (from_hub, to_hub) = stream.into_split();
    let mut session = Session {
        name: args.name,
        from_hub: BufReader::new(from_hub).lines(),
        to_hub,
        stdin: BufReader::new(io::stdin()).lines(),
    };

    print_line("*** connected; type \"quit\" or press ctrl+c to leave").await?;
    let outcome = session.chat().await;

    if let Err(err) = session.to_hub.shutdown().await {
        debug!(error = ?err, "hub connection already gone");
    }
    outcome
}

impl Session {
    async fn chat(&mut self) -> Result<()> {
        loop {
            match self.next_event().await? {
                Event::Broadcast(message) => print_line(&render(&message)).await?,
                Event::BlankLine => {}
                Event::HubHungUp => {
                    print_line("*** hub closed the connection").await?;
                    return Ok(());
                }
                Event::Typed(line) => match classify(&line) {
                    Input::Nothing => {}
                    Input::Leave => {
                        print_line("*** leaving chat").await?;
                        return Ok(());
                    }
                    Input::Say(text) => {
                        let message = ChatMessage::new(self.name.as_str(), text);
                        write_message(&mut self.to_hub, &message)
                            .await
                            .context("failed to send message to hub")?;
                    }
                },
                Event::InputClosed | Event::Interrupted => return Ok(()),
            }
        }
    }

    async fn next_event(&mut self) -> Result<Event> {
        let event = select! {
            received = self.from_hub.next_line() => {
                match received.context("failed to read from hub")? {
                    Some(line) => match ChatMessage::from_frame(line.as_bytes())
                        .context("hub sent a malformed message")?
                    {
                        Some(message) => Event::Broadcast(message),
                        None => Event::BlankLine,
                    },
                    None => Event::HubHungUp,
                }
            }
            typed = self.stdin.next_line() => {
                match typed.context("failed to read stdin")? {
                    Some(line) => Event::Typed(line),
                    None => Event::InputClosed,
                }
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!(error = ?err, "ctrl-c listener failed");
                }
                Event::Interrupted
            }
        };
        Ok(event)
    }
}

fn classify(line: &str) -> Input<'_> {
    let text = line.trim();
    if text.is_empty() {
        Input::Nothing
    } else if ["quit", "/quit"].iter().any(|cmd| text.eq_ignore_ascii_case(cmd)) {
        Input::Leave
    } else {
        Input::Say(text)
    }
}

fn render(message: &ChatMessage) -> String {
    format!("<{}> {}", message.sender, message.body)
}

async fn print_line(line: &str) -> io::Result<()> {
    let mut stdout = io::stdout();
    stdout.write_all(format!("{line}\n").as_bytes()).await?;
    stdout.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quit_is_case_insensitive_with_or_without_slash() {
        assert_eq!(classify("quit"), Input::Leave);
        assert_eq!(classify("QUIT\n"), Input::Leave);
        assert_eq!(classify("/quit"), Input::Leave);
        assert_eq!(classify("quitting"), Input::Say("quitting"));
    }

    #[test]
    fn blank_input_sends_nothing() {
        assert_eq!(classify("   \r"), Input::Nothing);
        assert_eq!(classify("  hi  "), Input::Say("hi"));
    }

    #[test]
    fn messages_render_with_sender_prefix() {
        assert_eq!(render(&ChatMessage::new("bob", "hi there")), "<bob> hi there");
    }
}
