use crate::controller::{Controller, EventReceiver, Transport};
use crate::domain::commands::KeyBindings;
use crate::domain::error::ConnectError;
use crate::domain::models::{ConnectionState, ControllerEvent, MessageSeverity, StatusMessage};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// One parsed piece of user input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Press(char),
    Release(char),
    ReleaseAll,
    Connect,
    Disconnect,
    Status,
    Help,
    Quit,
    Unknown(String),
}

/// Split a typed line into inputs.
///
/// `w` presses W, `-w` releases it, `ws` presses both in order; the words
/// `connect`, `disconnect`, `stop`, `status`, `help` and `quit` are commands.
pub fn parse_input(line: &str, bindings: &KeyBindings) -> Vec<Input> {
    let mut inputs = Vec::new();
    for token in line.split_whitespace() {
        match token.to_lowercase().as_str() {
            "connect" => inputs.push(Input::Connect),
            "disconnect" => inputs.push(Input::Disconnect),
            "stop" => inputs.push(Input::ReleaseAll),
            "status" => inputs.push(Input::Status),
            "help" | "?" => inputs.push(Input::Help),
            "quit" | "exit" => inputs.push(Input::Quit),
            word => {
                if let Some(keys) = word.strip_prefix('-') {
                    for key in keys.chars() {
                        inputs.push(match bindings.for_key(key) {
                            Some(_) => Input::Release(key),
                            None => Input::Unknown(format!("-{}", key)),
                        });
                    }
                } else {
                    for key in word.chars() {
                        inputs.push(match bindings.for_key(key) {
                            Some(_) => Input::Press(key),
                            None => Input::Unknown(key.to_string()),
                        });
                    }
                }
            }
        }
    }
    inputs
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Terminal front end: reads keys, drains controller events, prints status.
pub struct RemoteApp<T: Transport> {
    controller: Controller<T>,
    events: EventReceiver,
    connect_tx: mpsc::UnboundedSender<Result<(), ConnectError>>,
    connect_rx: mpsc::UnboundedReceiver<Result<(), ConnectError>>,
    bindings: KeyBindings,
    state: ConnectionState,
    status_message: Option<StatusMessage>,
}

impl<T: Transport> RemoteApp<T> {
    pub fn new(controller: Controller<T>, events: EventReceiver, bindings: KeyBindings) -> Self {
        let (connect_tx, connect_rx) = mpsc::unbounded_channel();
        Self {
            controller,
            events,
            connect_tx,
            connect_rx,
            bindings,
            state: ConnectionState::Idle,
            status_message: None,
        }
    }

    pub fn print_help(&self) {
        println!("Keys (type and press Enter, '-key' releases):");
        for binding in self.bindings.iter() {
            println!(
                "  [{}] {:<24} motor {} ({})",
                binding.key.to_ascii_uppercase(),
                binding.label,
                binding.channel.port(),
                binding.channel.role()
            );
        }
        println!("Commands: connect, disconnect, stop, status, help, quit");
    }

    pub fn print_status(&self) {
        match &self.status_message {
            Some(message) => println!("[{}] {}", self.state, message.message),
            None => println!("[{}]", self.state),
        }
    }

    pub fn connect(&self) {
        let replies = self.connect_tx.clone();
        // Runs on the controller thread; only hand the result over
        self.controller.connect(move |result| {
            let _ = replies.send(result);
        });
    }

    pub fn handle_input(&mut self, line: &str) -> Flow {
        for input in parse_input(line, &self.bindings) {
            match input {
                Input::Press(key) => self.press(key),
                Input::Release(key) => self.release(key),
                Input::ReleaseAll => {
                    for command in self.bindings.release_all() {
                        self.controller.send(command);
                    }
                }
                Input::Connect => self.connect(),
                Input::Disconnect => self.controller.disconnect(),
                Input::Status => self.print_status(),
                Input::Help => self.print_help(),
                Input::Quit => return Flow::Quit,
                Input::Unknown(token) => println!("Unknown key {:?}, type 'help'", token),
            }
        }
        Flow::Continue
    }

    fn press(&self, key: char) {
        if !self.controller.is_ready() {
            println!("Not connected, type 'connect' first");
            return;
        }
        if let Some(binding) = self.bindings.for_key(key) {
            self.controller.send(binding.press);
        }
    }

    fn release(&self, key: char) {
        if let Some(binding) = self.bindings.for_key(key) {
            self.controller.send(binding.release);
        }
    }

    pub fn handle_event(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::StateChanged(state) => {
                self.state = state;
                println!("[{}]", state);
            }
            ControllerEvent::LogMessage(message) => {
                let marker = match message.severity {
                    MessageSeverity::Info => "-",
                    MessageSeverity::Success => "+",
                    MessageSeverity::Warning => "!",
                    MessageSeverity::Error => "x",
                };
                println!("{} {}", marker, message.message);
                self.status_message = Some(message);
            }
        }
    }

    fn on_connect_result(&mut self, result: Result<(), ConnectError>) {
        match result {
            Ok(()) => {
                info!("Connected, control enabled");
                self.print_help();
            }
            Err(e) => {
                warn!("Connect failed: {}", e);
                println!("Connection failed: {}", e);
            }
        }
    }

    /// Main loop. Returns once the user quits or stdin closes; the controller
    /// is closed and its thread joined before returning.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        self.print_help();
        self.connect();

        loop {
            tokio::select! {
                Some(event) = self.events.recv() => self.handle_event(event),
                Some(result) = self.connect_rx.recv() => self.on_connect_result(result),
                line = lines.next_line() => match line? {
                    Some(line) => {
                        if self.handle_input(&line) == Flow::Quit {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        self.shutdown();
        Ok(())
    }

    pub fn shutdown(&mut self) {
        info!("Shutting down");
        self.controller.close();
        self.controller.join();
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
        }
    }
}
