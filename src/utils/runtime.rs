use std::process;

pub const AGENT_FLAG: &str = "--agent";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    Controller,
    Agent,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Controller => "controller",
            Self::Agent => "agent",
        }
    }

    /// Picks the mode from argv and returns the remaining arguments for
    /// config discovery and `--section.key value` overrides.
    pub fn from_args(args: impl IntoIterator<Item = String>) -> (Self, Vec<String>) {
        let mut mode = Self::Controller;
        let rest = args
            .into_iter()
            .filter(|arg| {
                if arg == AGENT_FLAG {
                    mode = Self::Agent;
                    false
                } else {
                    true
                }
            })
            .collect();
        (mode, rest)
    }
}

pub fn ensure_posix_or_exit() {
    if !cfg!(unix) {
        eprintln!("unsupported platform: convoy drives systemd and needs a POSIX host");
        process::exit(2);
    }
}
