use mesp_mesh::{MeshDelegate, PeerIdentity};
use parking_lot::Mutex;

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Peers,
    Msg { peer_id: String, text: String },
    Quit,
    Broadcast(String),
    Invalid(&'static str),
}

impl Command {
    /// Parse one input line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let command = match line.split_once(char::is_whitespace) {
            _ if line == "/peers" => Command::Peers,
            _ if line == "/quit" => Command::Quit,
            Some(("/msg", rest)) => match rest.trim().split_once(char::is_whitespace) {
                Some((peer_id, text)) if !text.trim().is_empty() => Command::Msg {
                    peer_id: peer_id.to_string(),
                    text: text.trim().to_string(),
                },
                _ => Command::Invalid("usage: /msg <peer-id> <text>"),
            },
            None if line == "/msg" => Command::Invalid("usage: /msg <peer-id> <text>"),
            _ if line.starts_with('/') => Command::Invalid("commands: /peers, /msg, /quit"),
            _ => Command::Broadcast(line.to_string()),
        };
        Some(command)
    }
}

/// Prints mesh notifications to the terminal.
#[derive(Default)]
pub struct ConsoleDelegate {
    last_devices: Mutex<Option<Vec<String>>>,
}

impl ConsoleDelegate {
    pub fn new() -> Self {
        Self::default()
    }
}

pub fn devices_line(connected: &[PeerIdentity]) -> String {
    let names: Vec<&str> = connected.iter().map(PeerIdentity::display_name).collect();
    format!("[√] Devices [{}]", names.join(", "))
}

impl MeshDelegate for ConsoleDelegate {
    fn on_peers_changed(&self, connected: &[PeerIdentity]) {
        let ids: Vec<String> = connected.iter().map(|p| p.id().to_string()).collect();
        let mut last = self.last_devices.lock();
        if last.as_ref() == Some(&ids) {
            return;
        }
        *last = Some(ids);
        println!("{}", devices_line(connected));
    }

    fn on_message(&self, text: &str, from: &PeerIdentity) {
        println!("[>] RECV: {} from {}", text, from.display_name());
    }
}
