use crate::{
    bus::{Event, EventBus},
    widget::{ChatWidget, ConversationState, IdentificationOutcome},
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tracing::{debug, error, info};

const HELP: &str = "Commands: /end ends the conversation, /new starts over, /toggle hides or shows the chat, /quit leaves.";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    End,
    New,
    Quit,
    Help,
    Toggle,
    Say(String),
}

impl Command {
    fn parse(line: &str) -> Self {
        match line.trim() {
            "/end" => Command::End,
            "/new" => Command::New,
            "/quit" | "/exit" => Command::Quit,
            "/help" => Command::Help,
            "/toggle" => Command::Toggle,
            text => Command::Say(text.to_string()),
        }
    }
}

/// Line-oriented front end for the chat widget.
pub struct TerminalInterface {
    bus: Arc<EventBus>,
    widget: Arc<ChatWidget>,
}

impl TerminalInterface {
    pub fn new(bus: Arc<EventBus>, widget: Arc<ChatWidget>) -> Self {
        Self { bus, widget }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        // Render widget events as they happen.
        let mut bus_rx = self.bus.subscribe();
        let printer = tokio::spawn(async move {
            while let Ok(event) = bus_rx.recv().await {
                render(&event);
            }
        });

        println!("{}", HELP);
        self.widget.open().await;

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let state = self.widget.state();
            let keep_going = match state {
                ConversationState::Unidentified | ConversationState::Identifying => {
                    self.identify(&mut lines).await?
                }
                _ => match read_line(&mut lines, "> ").await? {
                    Some(line) => self.dispatch(Command::parse(&line)).await,
                    None => false,
                },
            };
            if !keep_going {
                break;
            }
        }

        self.leave().await;
        printer.abort();
        Ok(())
    }

    /// Tell the backend the visitor is gone, the way a page unload would.
    pub async fn leave(&self) {
        info!("Leaving chat");
        self.widget.on_page_unload().await;
    }

    async fn dispatch(&self, command: Command) -> bool {
        debug!("Terminal command: {:?}", command);
        match command {
            Command::Quit => return false,
            Command::Help => println!("{}", HELP),
            Command::End => {
                if !self.widget.end_conversation().await {
                    println!("There is no active conversation to end.");
                }
            }
            Command::New => self.widget.start_new_conversation().await,
            Command::Toggle => {
                self.widget.toggle().await;
                if !self.widget.view().open {
                    println!("Chat hidden. Type /toggle to bring it back.");
                }
            }
            Command::Say(text) => {
                let outcome = self.widget.send_message(&text).await;
                debug!("Send outcome: {:?}", outcome);
            }
        }
        true
    }

    /// Walks the visitor through the identification form. Returns `false` on
    /// end of input.
    async fn identify(&self, lines: &mut Lines<BufReader<Stdin>>) -> anyhow::Result<bool> {
        let Some(name) = read_line(lines, "Name: ").await? else {
            return Ok(false);
        };
        if let Some(command) = slash_command(&name) {
            return Ok(self.dispatch(command).await);
        }
        let Some(email) = read_line(lines, "Email: ").await? else {
            return Ok(false);
        };
        let Some(phone) = read_line(lines, "Phone (optional): ").await? else {
            return Ok(false);
        };

        let outcome = self.widget.submit_identification(&name, &email, &phone).await;
        if outcome == IdentificationOutcome::InFlight {
            debug!("Identification already in flight");
        }
        Ok(true)
    }
}

fn slash_command(line: &str) -> Option<Command> {
    match Command::parse(line) {
        Command::Say(_) => None,
        command => Some(command),
    }
}

async fn read_line(
    lines: &mut Lines<BufReader<Stdin>>,
    prompt: &str,
) -> anyhow::Result<Option<String>> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(prompt.as_bytes()).await?;
    stdout.flush().await?;

    match lines.next_line().await {
        Ok(line) => Ok(line),
        Err(e) => {
            error!("Failed to read from stdin: {}", e);
            Err(e.into())
        }
    }
}

fn render(event: &Event) {
    match event {
        Event::MessageAdded(msg) => {
            for paragraph in msg.paragraphs() {
                println!("{}: {}", msg.sender, paragraph);
            }
        }
        Event::IdentificationRequested => {
            println!("Please tell us who you are to start chatting.")
        }
        Event::FormError(error) => println!("! {}", error),
        Event::ChatReady { welcome } => println!("{}", welcome),
        Event::Typing(true) => println!("Assistant is typing..."),
        Event::Typing(false) => {}
        Event::FinishActionShown { label } => println!("[{}] type /end to close this chat", label),
        Event::ConversationEnded => {
            println!("Conversation ended. Type /new to start a new conversation.")
        }
        Event::ConversationReset => println!("Starting a new conversation."),
    }
}
