use klimat_proto::{
    Brightness, Desired, DisplayMode, FanSpeed, Function, Mode, Power, MAX_HUMIDITY_TARGET,
};
use tracing::debug;

/// What a console line asks for
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Set(Desired),
    Info,
    Quit,
}

pub const HELP: &str = "Available commands:
  power on|off            fan silent|1|2|3|turbo
  mode auto|allergen|bacteria|manual|night|sleep
  function purification|humidification
  brightness on|off|25|50|75
  display iaq|pm25|humidity
  lock on|off             humidity 40|50|60|max
  info                    quit";

/// Parses a console line such as `fan turbo` into a command
pub fn parse_command(line: &str) -> Result<Command, String> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let (name, arg) = match parts.as_slice() {
        [name] => (name.to_lowercase(), None),
        [name, arg] => (name.to_lowercase(), Some(*arg)),
        [] => return Err("empty command".to_string()),
        _ => return Err(format!("too many arguments: {}", line.trim())),
    };

    debug!("Parsing command: {} {:?}", name, arg);

    match (name.as_str(), arg) {
        ("info", None) => Ok(Command::Info),
        ("quit" | "exit", None) => Ok(Command::Quit),
        (_, None) => Err(format!("{} requires an argument\n{}", name, HELP)),
        (_, Some(arg)) => set_command(&name, arg).map(Command::Set),
    }
}

fn set_command(name: &str, arg: &str) -> Result<Desired, String> {
    let mut desired = Desired::default();

    match name {
        "power" => desired.power = Some(arg.parse::<Power>()?),
        "fan" => desired.fan_speed = Some(arg.parse::<FanSpeed>()?),
        "mode" => desired.mode = Some(arg.parse::<Mode>()?),
        "function" => desired.function = Some(arg.parse::<Function>()?),
        "brightness" => desired.brightness = Some(arg.parse::<Brightness>()?),
        "display" => desired.display_mode = Some(arg.parse::<DisplayMode>()?),
        "lock" => desired.child_lock = Some(arg.parse::<Power>()? == Power::On),
        "humidity" => desired.humidity_target = Some(humidity_target(arg)?),
        _ => return Err(format!("Unknown command: {}\n{}", name, HELP)),
    }

    Ok(desired)
}

fn humidity_target(arg: &str) -> Result<u8, String> {
    match arg.to_lowercase().as_str() {
        "40" => Ok(40),
        "50" => Ok(50),
        "60" => Ok(60),
        "max" => Ok(MAX_HUMIDITY_TARGET),
        other => Err(format!("unknown humidity target: {}", other)),
    }
}
