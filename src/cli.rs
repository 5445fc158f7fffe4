//! Command-line REPL for driving a session

use anyhow::{anyhow, bail, Result};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tokio::sync::mpsc;

use looper_remote::{LoopAction, MidiMappingInfo, MidiType};

/// A parsed REPL line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Loops,
    Mappings,
    AddLoop(String),
    RemoveLoops(Vec<String>),
    Map(MidiMappingInfo),
    Unmap(MidiMappingInfo),
    Help,
    Exit,
}

pub const HELP: &str = "\
Commands:
  loops                                   list loops
  mappings                                list MIDI mappings
  add-loop <name>                         create a loop
  rm-loop <name>...                       delete loops
  map <ch> <type> <value> <action> <loop>     add a mapping
  unmap <ch> <type> <value> <action> <loop>   remove a mapping
        type: NoteOn | NoteOff | CCOn | CCOff
        action: TogglePlayback | ToggleRecording
  help, exit";

impl ReplCommand {
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&verb, rest)) = words.split_first() else {
            return Ok(None);
        };

        let command = match verb {
            "loops" => ReplCommand::Loops,
            "mappings" => ReplCommand::Mappings,
            "add-loop" => match rest {
                [name] => ReplCommand::AddLoop(name.to_string()),
                _ => bail!("usage: add-loop <name>"),
            },
            "rm-loop" if !rest.is_empty() => {
                ReplCommand::RemoveLoops(rest.iter().map(|s| s.to_string()).collect())
            }
            "rm-loop" => bail!("usage: rm-loop <name>..."),
            "map" => ReplCommand::Map(parse_mapping(rest)?),
            "unmap" => ReplCommand::Unmap(parse_mapping(rest)?),
            "help" | "?" => ReplCommand::Help,
            "exit" | "quit" => ReplCommand::Exit,
            other => bail!("unknown command '{}' (try 'help')", other),
        };
        Ok(Some(command))
    }
}

fn parse_mapping(words: &[&str]) -> Result<MidiMappingInfo> {
    let [channel, midi_type, value, action, loop_name] = words else {
        bail!("expected: <ch> <type> <value> <action> <loop>");
    };
    let channel: i64 = channel
        .parse()
        .map_err(|_| anyhow!("channel '{}' is not a number", channel))?;
    let value: i64 = value
        .parse()
        .map_err(|_| anyhow!("value '{}' is not a number", value))?;
    let midi_type: MidiType = midi_type.parse()?;
    let action: LoopAction = action.parse()?;

    Ok(MidiMappingInfo::new(channel, midi_type, value, *loop_name, action)?)
}

/// Read lines until EOF or `exit`, forwarding parsed commands
///
/// Blocking; run it on a dedicated thread.
pub fn run_repl(tx: mpsc::UnboundedSender<ReplCommand>) -> Result<()> {
    let mut rl = DefaultEditor::new()?;

    loop {
        match rl.readline("looper> ") {
            Ok(line) => {
                let _ = rl.add_history_entry(line.as_str());
                match ReplCommand::parse(&line) {
                    Ok(Some(ReplCommand::Help)) => println!("{}", HELP),
                    Ok(Some(command)) => {
                        let exit = command == ReplCommand::Exit;
                        if tx.send(command).is_err() || exit {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => println!("{}", e),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                let _ = tx.send(ReplCommand::Exit);
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}
