use crate::daemon::{Direction, Interface, DAEMON_NAME_LEN, FORMAT_LEN, INTERFACE_NAME_LEN, TYPE_LEN};
use crate::error::HouseError;

//===----------------------------------------------------------------------===//
// Manifest (.proc) parsing
//
// Line-oriented UTF-8. Recognised labels are `name:`, `filename:` and
// repeated `interface:` declarations; anything else is ignored. This is the
// only form an interface declaration takes before the daemon runs.
//===----------------------------------------------------------------------===//

/// Truncate to at most `max` bytes without splitting a character.
pub fn clip(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub name: String,
    pub filename: String,
    pub interfaces: Vec<Interface>,
}

impl Manifest {
    pub fn parse(data: &[u8]) -> Result<Manifest, HouseError> {
        let text = String::from_utf8_lossy(data);
        let mut name = String::new();
        let mut filename = String::new();
        let mut interfaces = Vec::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim_end();
            if let Some(rest) = line.strip_prefix("name:") {
                name = clip(rest.trim(), DAEMON_NAME_LEN);
            } else if let Some(rest) = line.strip_prefix("filename:") {
                filename = clip(rest.trim(), DAEMON_NAME_LEN);
            } else if let Some(rest) = line.strip_prefix("interface:") {
                interfaces.push(parse_interface(idx + 1, rest)?);
            }
        }

        if filename.is_empty() {
            return Err(HouseError::Manifest {
                line: 0,
                reason: "missing filename".to_string(),
            });
        }
        if name.is_empty() {
            name = filename.clone();
        }
        Ok(Manifest { name, filename, interfaces })
    }
}

/// One `interface: NAME,TYPE,FORMAT,DIR,TRIG` declaration.
fn parse_interface(line: usize, rest: &str) -> Result<Interface, HouseError> {
    let fields: Vec<&str> = rest.split(',').map(str::trim).collect();
    if fields.len() != 5 {
        return Err(HouseError::Manifest {
            line,
            reason: format!("expected 5 interface fields, found {}", fields.len()),
        });
    }
    let flag = |s: &str, what: &str| -> Result<u8, HouseError> {
        s.parse::<u8>().map_err(|_| HouseError::Manifest {
            line,
            reason: format!("{} must be 0 or 1, found '{}'", what, s),
        })
    };
    Ok(Interface {
        name: clip(fields[0], INTERFACE_NAME_LEN),
        kind: clip(fields[1], TYPE_LEN),
        format: clip(fields[2], FORMAT_LEN),
        direction: Direction::from_flag(flag(fields[3], "direction")?),
        triggering: flag(fields[4], "triggering")? != 0,
    })
}
