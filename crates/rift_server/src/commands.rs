use rift_shared::entity::EntityKind;

const PORTALS_USAGE: &str = "Usage: /portals <player|id> [on|off]";
const SUMMON_USAGE: &str = "Usage: /summon <kind> <world> <x> <y> <z>";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Noop,
    Stop,
    List,
    /// `enabled: None` toggles the current setting.
    Portals {
        player: String,
        enabled: Option<bool>,
    },
    Summon {
        kind: EntityKind,
        world: u32,
        x: f32,
        y: f32,
        z: f32,
    },
    Help,
    InvalidUsage(String),
    Unknown(String),
}

pub fn parse_command(line: &str) -> Command {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Command::Noop;
    }

    let input = trimmed.strip_prefix('/').unwrap_or(trimmed);
    if input.is_empty() {
        return Command::Noop;
    }

    let mut head_tail = input.splitn(2, char::is_whitespace);
    let command = head_tail.next().unwrap_or_default().to_ascii_lowercase();
    let rest = head_tail.next().unwrap_or("").trim();

    match command.as_str() {
        "stop" => Command::Stop,
        "list" => Command::List,
        "help" => Command::Help,
        "portals" => {
            let mut args = rest.split_whitespace();
            match (args.next(), args.next(), args.next()) {
                (Some(player), switch, None) => match switch.map(parse_switch) {
                    None => Command::Portals {
                        player: player.to_string(),
                        enabled: None,
                    },
                    Some(Some(enabled)) => Command::Portals {
                        player: player.to_string(),
                        enabled: Some(enabled),
                    },
                    Some(None) => Command::InvalidUsage(PORTALS_USAGE.to_string()),
                },
                _ => Command::InvalidUsage(PORTALS_USAGE.to_string()),
            }
        }
        "summon" => {
            let args: Vec<&str> = rest.split_whitespace().collect();
            let [kind, world, x, y, z] = args.as_slice() else {
                return Command::InvalidUsage(SUMMON_USAGE.to_string());
            };
            let Some(kind) = EntityKind::parse(kind) else {
                return Command::InvalidUsage(format!("unknown entity kind '{kind}'"));
            };
            let parsed = (
                world.parse::<u32>(),
                x.parse::<f32>(),
                y.parse::<f32>(),
                z.parse::<f32>(),
            );
            match parsed {
                (Ok(world), Ok(x), Ok(y), Ok(z)) => Command::Summon { kind, world, x, y, z },
                _ => Command::InvalidUsage(SUMMON_USAGE.to_string()),
            }
        }
        _ => Command::Unknown(input.to_string()),
    }
}

/// Parses the argument of a player's own `/portals [on|off]` chat command.
/// `Err` carries the usage line to send back.
pub fn parse_self_toggle(rest: &str) -> Result<Option<bool>, &'static str> {
    const USAGE: &str = "Usage: /portals [on|off]";
    let mut args = rest.split_whitespace();
    match (args.next(), args.next()) {
        (None, _) => Ok(None),
        (Some(switch), None) => parse_switch(switch).map(Some).ok_or(USAGE),
        _ => Err(USAGE),
    }
}

fn parse_switch(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "enable" => Some(true),
        "off" | "false" | "disable" => Some(false),
        _ => None,
    }
}
