/// Session meta-commands, parsed once at the caller boundary. Anything that
/// does not match is treated as source code for the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    /// List variables held by the live interpreter.
    Vars,
    /// Delete all user variables without restarting the interpreter.
    Clear,
    /// Kill the interpreter; a fresh one starts on the next call.
    Reset,
    /// Report host-side session metadata.
    Memory,
    /// Describe the available commands.
    Help,
}

impl SessionCommand {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim() {
            "/vars" => Some(SessionCommand::Vars),
            "/clear" => Some(SessionCommand::Clear),
            "/reset" => Some(SessionCommand::Reset),
            "/memory" => Some(SessionCommand::Memory),
            "/help" => Some(SessionCommand::Help),
            _ => None,
        }
    }
}

pub(crate) const HELP_TEXT: &str = "\
session commands:
  /vars    list variables in the live interpreter
  /clear   delete all variables, keeping the interpreter running
  /reset   kill the interpreter; a fresh one starts on the next call
  /memory  show session metadata (state, spawns, requests, variables)
  /help    show this message
anything else is executed as source code";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_commands() {
        assert_eq!(SessionCommand::parse("/vars"), Some(SessionCommand::Vars));
        assert_eq!(SessionCommand::parse("/clear"), Some(SessionCommand::Clear));
        assert_eq!(SessionCommand::parse("/reset"), Some(SessionCommand::Reset));
        assert_eq!(
            SessionCommand::parse("/memory"),
            Some(SessionCommand::Memory)
        );
        assert_eq!(SessionCommand::parse("/help"), Some(SessionCommand::Help));
    }

    #[test]
    fn tolerates_surrounding_whitespace() {
        assert_eq!(
            SessionCommand::parse("  /reset\n"),
            Some(SessionCommand::Reset)
        );
    }

    #[test]
    fn everything_else_is_code() {
        assert_eq!(SessionCommand::parse("x = 5"), None);
        assert_eq!(SessionCommand::parse("/unknown"), None);
        assert_eq!(SessionCommand::parse("/vars()"), None);
        assert_eq!(SessionCommand::parse(""), None);
    }
}
