//! The implementation of the `DYNJIT_LOG*` environment variables.

use std::{env, error::Error, fs::File, io::Write, path::PathBuf};
use strum::{EnumCount, FromRepr};

pub(crate) mod stats;

/// How verbose should dynjit's normal logging be?
#[repr(u8)]
#[derive(Copy, Clone, Debug, EnumCount, FromRepr, PartialEq, PartialOrd)]
pub(crate) enum Verbosity {
    /// Disable logging entirely.
    Disabled,
    /// Log errors.
    Error,
    /// Log warnings (e.g. a function the JIT can't compile).
    Warning,
    /// Log JIT events (e.g. a function being compiled, a deopt).
    JITEvent,
    /// Log every entry into compiled code.
    Execution,
}

pub(crate) struct Log {
    /// The requested [Verbosity] level for logging.
    level: Verbosity,
    /// The path to append to. `None` means stderr.
    path: Option<PathBuf>,
}

impl Log {
    pub(crate) fn new() -> Result<Self, Box<dyn Error>> {
        match env::var("DYNJIT_LOG") {
            Ok(s) => Self::from_setting(&s),
            Err(_) => Ok(Self {
                path: None,
                level: Verbosity::Error,
            }),
        }
    }

    /// Parse a `[<path>|-:]<level>` setting.
    fn from_setting(s: &str) -> Result<Self, Box<dyn Error>> {
        let (path, level) = match s.split(':').collect::<Vec<_>>()[..] {
            [path, level] => {
                if path == "-" {
                    (None, level)
                } else {
                    let path = PathBuf::from(path);
                    // Start each run with an empty log.
                    File::create(&path).ok();
                    (Some(path), level)
                }
            }
            [level] => (None, level),
            [..] => return Err("DYNJIT_LOG must be of the format `[<path|->:]<level>`".into()),
        };
        let level = level
            .parse::<u8>()
            .map_err(|e| format!("Invalid DYNJIT_LOG level '{s}': {e}"))?;
        let max_level = Verbosity::COUNT - 1;
        let level = Verbosity::from_repr(level)
            .ok_or_else(|| format!("DYNJIT_LOG level {level} exceeds maximum {max_level}"))?;
        Ok(Self { path, level })
    }

    /// Log `msg` with the [Verbosity] level `level`.
    ///
    /// # Panics
    ///
    /// If `level == Verbosity::Disabled`.
    pub(crate) fn log(&self, level: Verbosity, msg: &str) {
        if level <= self.level {
            let prefix = match level {
                Verbosity::Disabled => panic!(),
                Verbosity::Error => "dynjit-error",
                Verbosity::Warning => "dynjit-warning",
                Verbosity::JITEvent => "dynjit-jit-event",
                Verbosity::Execution => "dynjit-execution",
            };
            match &self.path {
                Some(p) => {
                    let s = format!("{prefix}: {msg}\n");
                    File::options()
                        .append(true)
                        .open(p)
                        .map(|mut x| x.write(s.as_bytes()))
                        .ok();
                }
                None => {
                    eprintln!("{prefix}: {msg}");
                }
            }
        }
    }
}

/// The stages of the pipeline whose IR can be printed with `DYNJIT_LOG_IR`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) enum IRPhase {
    /// HIR as built from bytecode.
    HIR,
    /// HIR after refcount insertion.
    HIRRefcount,
    /// LIR before register allocation.
    LIR,
    /// LIR with the allocator's locations.
    LIRAlloc,
    /// The generated machine code.
    Asm,
}

impl IRPhase {
    fn from_str(s: &str) -> Result<Self, Box<dyn Error>> {
        match s {
            "hir" => Ok(Self::HIR),
            "hir-refcount" => Ok(Self::HIRRefcount),
            "lir" => Ok(Self::LIR),
            "lir-alloc" => Ok(Self::LIRAlloc),
            "asm" => Ok(Self::Asm),
            _ => Err(format!("Invalid DYNJIT_LOG_IR value: {s}").into()),
        }
    }

    /// The name used in `--- Begin <name> ---` markers.
    pub(crate) fn name(self) -> &'static str {
        match self {
            Self::HIR => "hir",
            Self::HIRRefcount => "hir-refcount",
            Self::LIR => "lir",
            Self::LIRAlloc => "lir-alloc",
            Self::Asm => "asm",
        }
    }
}

mod internals {
    use super::IRPhase;
    use std::{collections::HashSet, env, error::Error, fs::File, io::Write, sync::LazyLock};

    type LogIr = Result<Option<(String, HashSet<IRPhase>)>, String>;

    static LOG_IR: LazyLock<LogIr> = LazyLock::new(|| match env::var("DYNJIT_LOG_IR") {
        Ok(x) => parse(&x).map(Some).map_err(|e| e.to_string()),
        Err(_) => Ok(None),
    });

    /// Parse a `[<path>:]<phase>[,...]` setting.
    pub(super) fn parse(x: &str) -> Result<(String, HashSet<IRPhase>), Box<dyn Error>> {
        let (path, phases) = match x.split(':').collect::<Vec<_>>().as_slice() {
            [path, phases] => (*path, *phases),
            [phases] => ("-", *phases),
            _ => {
                return Err(
                    "DYNJIT_LOG_IR must be of the format '[<path>:]<phase_1>[,...,<phase_n>]'"
                        .into(),
                )
            }
        };
        let mut log_phases = HashSet::new();
        for x in phases.split(',') {
            log_phases.insert(IRPhase::from_str(x)?);
        }
        if path != "-" {
            File::create(path).ok();
        }
        Ok((path.to_string(), log_phases))
    }

    /// Check that `DYNJIT_LOG_IR` is well formed.
    pub(crate) fn check_log_ir() -> Result<(), Box<dyn Error>> {
        match &*LOG_IR {
            Ok(_) => Ok(()),
            Err(e) => Err(e.clone().into()),
        }
    }

    pub(crate) fn should_log_ir(phase: IRPhase) -> bool {
        matches!(&*LOG_IR, Ok(Some((_, phases))) if phases.contains(&phase))
    }

    pub(crate) fn log_ir(s: &str) {
        match &*LOG_IR {
            Ok(Some((p, _))) if p == "-" => eprint!("{s}"),
            Ok(Some((p, _))) => {
                File::options()
                    .append(true)
                    .open(p)
                    .map(|mut x| x.write(s.as_bytes()))
                    .ok();
            }
            _ => (),
        }
    }
}

pub(crate) use internals::{check_log_ir, log_ir, should_log_ir};

/// If `phase` was requested, log the IR produced by `f` between begin/end markers.
pub(crate) fn log_ir_phase<F: FnOnce() -> String>(phase: IRPhase, f: F) {
    if should_log_ir(phase) {
        let name = phase.name();
        log_ir(&format!("--- Begin {name} ---\n{}\n--- End {name} ---\n", f()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_setting() {
        let l = Log::from_setting("3").unwrap();
        assert_eq!(l.level, Verbosity::JITEvent);
        assert!(l.path.is_none());
        let l = Log::from_setting("-:1").unwrap();
        assert_eq!(l.level, Verbosity::Error);
        assert!(Log::from_setting("9").is_err());
        assert!(Log::from_setting("a:b:c").is_err());
        assert!(Log::from_setting("x").is_err());
    }

    #[test]
    fn log_ir_setting() {
        let (path, phases) = internals::parse("hir,asm").unwrap();
        assert_eq!(path, "-");
        assert!(phases.contains(&IRPhase::HIR));
        assert!(phases.contains(&IRPhase::Asm));
        assert!(!phases.contains(&IRPhase::LIR));
        assert!(internals::parse("-:jit-pre-opt").is_err());
    }
}
