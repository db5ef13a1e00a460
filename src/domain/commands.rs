//! Motor command alphabet
//!
//! The hub program reads one ASCII byte at a time from stdin and maps it to a
//! motor action. [`CommandMap`] is that mapping as data, built once and shared
//! read-only; [`KeyBindings`] pairs front-end keys with press/release commands.

use std::collections::HashMap;
use std::fmt;

/// One command byte as understood by the hub program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Command(u8);

impl Command {
    /// Build a command from an ASCII character. Non-ASCII yields `None`.
    pub fn from_char(c: char) -> Option<Self> {
        if c.is_ascii() {
            Some(Self(c as u8))
        } else {
            None
        }
    }

    pub fn byte(self) -> u8 {
        self.0
    }

    pub fn as_char(self) -> char {
        self.0 as char
    }

    /// Wire encoding: exactly one byte, no framing.
    pub fn encode(self) -> [u8; 1] {
        [self.0]
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}'", self.as_char())
    }
}

/// Hub motor ports driven by the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MotorChannel {
    /// Rotating base
    A,
    /// Main arm
    B,
    /// Gripper
    C,
    /// Wrist elevator
    E,
}

impl MotorChannel {
    pub fn port(&self) -> char {
        match self {
            Self::A => 'A',
            Self::B => 'B',
            Self::C => 'C',
            Self::E => 'E',
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Self::A => "Rotating base",
            Self::B => "Main arm",
            Self::C => "Gripper",
            Self::E => "Wrist elevator",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorAction {
    /// Run at a constant speed in deg/s; sign gives direction.
    Run { speed: i32 },
    /// Stop and actively keep position.
    Hold,
    /// Stop and coast.
    Stop,
}

/// Immutable command-to-action table.
#[derive(Debug, Clone)]
pub struct CommandMap {
    entries: HashMap<Command, (MotorChannel, MotorAction)>,
}

impl CommandMap {
    pub fn new(entries: impl IntoIterator<Item = (char, MotorChannel, MotorAction)>) -> Self {
        let entries = entries
            .into_iter()
            .filter_map(|(c, channel, action)| {
                Command::from_char(c).map(|cmd| (cmd, (channel, action)))
            })
            .collect();
        Self { entries }
    }

    /// The table the bundled hub program implements.
    pub fn standard() -> Self {
        use MotorAction::{Hold, Run, Stop};
        use MotorChannel::{A, B, C, E};

        Self::new([
            ('a', A, Run { speed: -200 }),
            ('d', A, Run { speed: 200 }),
            ('q', A, Stop),
            ('w', B, Run { speed: -200 }),
            ('s', B, Run { speed: 200 }),
            ('e', B, Hold),
            ('o', C, Run { speed: -100 }),
            ('c', C, Run { speed: 100 }),
            ('z', C, Stop),
            ('i', E, Run { speed: 100 }),
            ('k', E, Run { speed: -100 }),
            ('m', E, Hold),
        ])
    }

    /// Resolve a front-end character into a recognized command.
    pub fn resolve(&self, c: char) -> Option<Command> {
        Command::from_char(c).filter(|cmd| self.entries.contains_key(cmd))
    }

    pub fn lookup(&self, command: Command) -> Option<(MotorChannel, MotorAction)> {
        self.entries.get(&command).copied()
    }
}

/// A front-end key that drives one motor while held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBinding {
    pub key: char,
    pub label: &'static str,
    pub channel: MotorChannel,
    pub press: char,
    pub release: char,
}

#[derive(Debug, Clone)]
pub struct KeyBindings {
    bindings: Vec<KeyBinding>,
}

impl KeyBindings {
    pub fn new(bindings: Vec<KeyBinding>) -> Self {
        Self { bindings }
    }

    pub fn standard() -> Self {
        let bind = |key, label, channel, press, release| KeyBinding {
            key,
            label,
            channel,
            press,
            release,
        };

        Self::new(vec![
            bind('w', "Arm up", MotorChannel::B, 'w', 'e'),
            bind('s', "Arm down", MotorChannel::B, 's', 'e'),
            bind('a', "Base clockwise", MotorChannel::A, 'a', 'q'),
            bind('d', "Base counter-clockwise", MotorChannel::A, 'd', 'q'),
            bind('o', "Gripper open", MotorChannel::C, 'o', 'z'),
            bind('c', "Gripper close", MotorChannel::C, 'c', 'z'),
            bind('i', "Wrist up", MotorChannel::E, 'i', 'm'),
            bind('k', "Wrist down", MotorChannel::E, 'k', 'm'),
        ])
    }

    /// Case-insensitive key lookup.
    pub fn for_key(&self, key: char) -> Option<&KeyBinding> {
        let key = key.to_ascii_lowercase();
        self.bindings.iter().find(|b| b.key == key)
    }

    /// One release command per channel, in binding order.
    pub fn release_all(&self) -> Vec<char> {
        let mut seen = Vec::new();
        let mut releases = Vec::new();
        for binding in &self.bindings {
            if !seen.contains(&binding.channel) {
                seen.push(binding.channel);
                releases.push(binding.release);
            }
        }
        releases
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyBinding> {
        self.bindings.iter()
    }
}
