//! Line-oriented control commands.

use anyhow::{anyhow, bail, Context, Result};
use murmur_core::{AssetId, Volume};

pub const HELP: &str = "\
commands:
  theme <id>                        crossfade to a theme
  volume <level>                    main volume of the active theme
  layer <id> <level>                layer volume
  mute                              toggle master mute
  reset <theme> <level> [layer[=level] ...]
                                    fade out, reassign, fade in
  custom <id>                       apply a custom theme
  custom save <id> [name]           save the current mix
  custom delete <id>                delete a custom theme
  custom list                       list custom themes
  status | mix | help | quit
levels are 0..1 or a percentage such as 40%";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Theme(AssetId),
    Volume(f32),
    Layer {
        id: AssetId,
        volume: f32,
    },
    Mute,
    Reset {
        theme: AssetId,
        main_volume: f32,
        /// Listed layers, with an explicit level when one was given.
        layers: Vec<(AssetId, Option<f32>)>,
    },
    CustomApply(AssetId),
    CustomSave {
        id: AssetId,
        name: String,
    },
    CustomDelete(AssetId),
    CustomList,
    Status,
    Mix,
    Help,
    Quit,
}

impl Command {
    /// Whether the command changes what gets persisted.
    pub const fn changes_snapshot(&self) -> bool {
        !matches!(
            self,
            Self::Mute | Self::CustomList | Self::Status | Self::Mix | Self::Help | Self::Quit
        )
    }
}

/// Parse `0.4`, `40%` or `40 %` into a clamped level.
pub fn parse_level(text: &str) -> Result<f32> {
    let text = text.trim();
    let value = match text.strip_suffix('%') {
        Some(percent) => {
            let percent: f32 = percent
                .trim()
                .parse()
                .with_context(|| format!("'{text}' is not a percentage"))?;
            percent / 100.0
        }
        None => text
            .parse::<f32>()
            .with_context(|| format!("'{text}' is not a level"))?,
    };
    Ok(Volume::new(value).as_f32())
}

fn arg<'a>(args: &[&'a str], index: usize, what: &str) -> Result<&'a str> {
    args.get(index)
        .copied()
        .ok_or_else(|| anyhow!("missing {what}"))
}

/// Parse one input line. Blank lines and `#` comments yield `None`.
pub fn parse(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let words: Vec<&str> = line.split_whitespace().collect();
    let (verb, args) = words
        .split_first()
        .ok_or_else(|| anyhow!("empty command"))?;

    let command = match verb.to_ascii_lowercase().as_str() {
        "theme" => Command::Theme(arg(args, 0, "theme id")?.into()),
        "volume" | "vol" => Command::Volume(parse_level(arg(args, 0, "level")?)?),
        "layer" => Command::Layer {
            id: arg(args, 0, "layer id")?.into(),
            volume: parse_level(arg(args, 1, "level")?)?,
        },
        "mute" | "unmute" => Command::Mute,
        "reset" => {
            let theme = arg(args, 0, "theme id")?.into();
            let main_volume = parse_level(arg(args, 1, "level")?)?;
            let layers = args[2..]
                .iter()
                .map(|spec| match spec.split_once('=') {
                    Some((id, level)) => Ok((AssetId::from(id), Some(parse_level(level)?))),
                    None => Ok((AssetId::from(*spec), None)),
                })
                .collect::<Result<Vec<_>>>()?;
            Command::Reset {
                theme,
                main_volume,
                layers,
            }
        }
        "custom" => match arg(args, 0, "custom theme id or subcommand")? {
            "list" => Command::CustomList,
            "save" => {
                let id = arg(args, 1, "custom theme id")?;
                let name = if args.len() > 2 {
                    args[2..].join(" ")
                } else {
                    id.to_string()
                };
                Command::CustomSave {
                    id: id.into(),
                    name,
                }
            }
            "delete" | "rm" => Command::CustomDelete(arg(args, 1, "custom theme id")?.into()),
            id => Command::CustomApply(id.into()),
        },
        "status" => Command::Status,
        "mix" => Command::Mix,
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        other => bail!("unknown command '{other}' (try 'help')"),
    };
    Ok(Some(command))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

    use super::*;

    #[test]
    fn test_levels() {
        assert!((parse_level("0.4").unwrap() - 0.4).abs() < f32::EPSILON);
        assert!((parse_level("40%").unwrap() - 0.4).abs() < 1e-6);
        assert!((parse_level("250%").unwrap() - 1.0).abs() < f32::EPSILON);
        assert!(parse_level("-1").unwrap().abs() < f32::EPSILON);
        assert!(parse_level("loud").is_err());
    }

    #[test]
    fn test_simple_commands() {
        assert_eq!(parse("theme lofi").unwrap(), Some(Command::Theme("lofi".into())));
        assert_eq!(parse("  VOLUME 50% ").unwrap(), Some(Command::Volume(0.5)));
        assert_eq!(
            parse("layer rain 0.3").unwrap(),
            Some(Command::Layer {
                id: "rain".into(),
                volume: 0.3
            })
        );
        assert_eq!(parse("mute").unwrap(), Some(Command::Mute));
        assert_eq!(parse("q").unwrap(), Some(Command::Quit));
        assert_eq!(parse("").unwrap(), None);
        assert_eq!(parse("# comment").unwrap(), None);
    }

    #[test]
    fn test_reset_with_layer_levels() {
        let command = parse("reset b 0.7 forest=0.5 birds").unwrap().unwrap();
        assert_eq!(
            command,
            Command::Reset {
                theme: "b".into(),
                main_volume: 0.7,
                layers: vec![("forest".into(), Some(0.5)), ("birds".into(), None)],
            }
        );
        assert!(parse("reset b 0.7 forest=x").is_err());
    }

    #[test]
    fn test_custom_subcommands() {
        assert_eq!(parse("custom list").unwrap(), Some(Command::CustomList));
        assert_eq!(
            parse("custom save night Late Night").unwrap(),
            Some(Command::CustomSave {
                id: "night".into(),
                name: "Late Night".into()
            })
        );
        assert_eq!(
            parse("custom delete night").unwrap(),
            Some(Command::CustomDelete("night".into()))
        );
        assert_eq!(parse("custom night").unwrap(), Some(Command::CustomApply("night".into())));
    }

    #[test]
    fn test_errors() {
        assert!(parse("layer rain").is_err());
        assert!(parse("theme").is_err());
        assert!(parse("dance").is_err());
    }

    #[test]
    fn test_snapshot_relevance() {
        assert!(Command::Theme("a".into()).changes_snapshot());
        assert!(!Command::Status.changes_snapshot());
        assert!(!Command::Mute.changes_snapshot());
    }
}
