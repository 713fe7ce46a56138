//! Operator console: stdin lines become commands, events become lines.

use mesh_node::MeshEvent;
use mesh_wire::node_id_string;
use thiserror::Error;

use crate::config::parse_node_id;

pub const HELP: &str = "\
<text>                       broadcast text on the primary channel
/dm <node> <text>            direct message with acknowledgement
/verify <node>               start key verification
/number <node> <nonce> <n>   enter the number shown on <node>
/done                        close verification after comparing codes
/status                      queue and peer counters
/forget <node>               forget a peer key
/wipe                        forget every peer key
/quit                        flush and exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Broadcast(String),
    Direct { dest: u32, text: String },
    Verify(u32),
    Number { remote: u32, nonce: u64, number: u32 },
    Done,
    Status,
    Forget(u32),
    Wipe,
    Help,
    Quit,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("bad node id {0:?}")]
    NodeId(String),

    #[error("bad number {0:?}")]
    Number(String),

    #[error("unknown command {0}, try /help")]
    Unknown(String),
}

fn node(arg: Option<&str>, usage: &'static str) -> Result<u32, ConsoleError> {
    let arg = arg.ok_or(ConsoleError::Usage(usage))?;
    parse_node_id(arg).map_err(|_| ConsoleError::NodeId(arg.to_string()))
}

/// Parse one line; `None` for blank lines
pub fn parse_line(line: &str) -> Result<Option<ConsoleCommand>, ConsoleError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if !line.starts_with('/') {
        return Ok(Some(ConsoleCommand::Broadcast(line.to_string())));
    }

    let (cmd, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let mut args = rest.split_whitespace();

    let command = match cmd {
        "/dm" => {
            const USAGE: &str = "/dm <node> <text>";
            let (dest, text) = rest.split_once(char::is_whitespace).ok_or(ConsoleError::Usage(USAGE))?;
            let text = text.trim();
            if text.is_empty() {
                return Err(ConsoleError::Usage(USAGE));
            }
            ConsoleCommand::Direct {
                dest: node(Some(dest), USAGE)?,
                text: text.to_string(),
            }
        }
        "/verify" => ConsoleCommand::Verify(node(args.next(), "/verify <node>")?),
        "/number" => {
            const USAGE: &str = "/number <node> <nonce> <n>";
            let remote = node(args.next(), USAGE)?;
            let nonce = args.next().ok_or(ConsoleError::Usage(USAGE))?;
            let number = args.next().ok_or(ConsoleError::Usage(USAGE))?;
            ConsoleCommand::Number {
                remote,
                nonce: nonce
                    .parse()
                    .map_err(|_| ConsoleError::Number(nonce.to_string()))?,
                number: number
                    .parse()
                    .map_err(|_| ConsoleError::Number(number.to_string()))?,
            }
        }
        "/done" => ConsoleCommand::Done,
        "/status" => ConsoleCommand::Status,
        "/forget" => ConsoleCommand::Forget(node(args.next(), "/forget <node>")?),
        "/wipe" => ConsoleCommand::Wipe,
        "/help" => ConsoleCommand::Help,
        "/quit" | "/exit" => ConsoleCommand::Quit,
        other => return Err(ConsoleError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

/// One line describing an event
pub fn describe(event: &MeshEvent) -> String {
    match event {
        MeshEvent::SendResult { msg_id, ok: true } => format!("sent #{}", msg_id),
        MeshEvent::SendResult { msg_id, ok: false } => format!("FAILED #{}", msg_id),
        MeshEvent::IdentityUpdate {
            node_id,
            short_name,
            long_name,
            signal_quality,
            ..
        } => format!(
            "{} is {} ({}) rssi={} snr={:.1}",
            node_id_string(*node_id),
            short_name,
            long_name,
            signal_quality.rssi,
            signal_quality.snr
        ),
        MeshEvent::VerificationNumberInform {
            remote,
            nonce,
            number,
        } => format!(
            "verification with {}: read out {:06} (nonce {})",
            node_id_string(*remote),
            number,
            nonce
        ),
        MeshEvent::VerificationNumberRequest { remote, nonce } => format!(
            "verification with {}: enter /number {} {} <n>",
            node_id_string(*remote),
            node_id_string(*remote),
            nonce
        ),
        MeshEvent::VerificationFinal {
            remote,
            pairing_code,
            ..
        } => format!(
            "verification with {}: compare code [{}], then /done",
            node_id_string(*remote),
            pairing_code
        ),
        MeshEvent::TextReceived {
            from, text, pki, ..
        } => format!(
            "{}{}: {}",
            node_id_string(*from),
            if *pki { " (direct)" } else { "" },
            text
        ),
        MeshEvent::PositionReceived { from, position, .. } => format!(
            "{} at {:?},{:?}",
            node_id_string(*from),
            position.latitude_i.map(|v| f64::from(v) * 1e-7),
            position.longitude_i.map(|v| f64::from(v) * 1e-7)
        ),
        MeshEvent::AppData {
            from,
            portnum,
            payload,
            ..
        } => format!(
            "{} sent {} bytes on port {}",
            node_id_string(*from),
            payload.len(),
            portnum
        ),
    }
}
