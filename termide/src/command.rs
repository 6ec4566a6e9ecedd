/// Slash commands in match order (token, description).
pub const COMMANDS: &[(&str, &str)] = &[
    ("/help", "Show available commands"),
    ("/explain", "Explain the current code"),
    ("/refactor", "Refactor the current code"),
    ("/optimize", "Optimize the current code for performance"),
    ("/document", "Add documentation to the current code"),
    ("/fix", "Fix bugs in the current code"),
    ("/test", "Generate tests for the current code"),
    ("/search", "Search the project for files or text"),
    ("/open", "Open a file in the editor"),
];

/// A recognised slash command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    Help,
    Explain,
    Refactor,
    Optimize,
    Document,
    Fix,
    Test,
    Search,
    Open,
}

impl Command {
    pub const ALL: [Command; 9] = [
        Command::Help,
        Command::Explain,
        Command::Refactor,
        Command::Optimize,
        Command::Document,
        Command::Fix,
        Command::Test,
        Command::Search,
        Command::Open,
    ];

    pub fn token(self) -> &'static str {
        match self {
            Command::Help => "/help",
            Command::Explain => "/explain",
            Command::Refactor => "/refactor",
            Command::Optimize => "/optimize",
            Command::Document => "/document",
            Command::Fix => "/fix",
            Command::Test => "/test",
            Command::Search => "/search",
            Command::Open => "/open",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.token() == token)
    }

    pub fn description(self) -> &'static str {
        COMMANDS
            .iter()
            .find(|(token, _)| *token == self.token())
            .map(|(_, desc)| *desc)
            .unwrap_or_default()
    }

    /// Commands whose answer is a replacement for the open file.
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            Command::Refactor
                | Command::Optimize
                | Command::Document
                | Command::Fix
                | Command::Test
        )
    }

    /// Commands answered locally, without a model call.
    pub fn is_local(self) -> bool {
        matches!(self, Command::Help | Command::Search | Command::Open)
    }
}

/// Result of classifying one line of user input.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedCommand {
    pub is_command: bool,
    /// Matched token, or empty for chat input.
    pub command: String,
    pub args: String,
}

impl ParsedCommand {
    pub fn kind(&self) -> Option<Command> {
        Command::from_token(&self.command)
    }
}

/// Classify input by prefix against [`COMMANDS`]. The first matching token wins.
pub fn parse_command(message: &str) -> ParsedCommand {
    let message = message.trim_start();
    for (token, _) in COMMANDS {
        if let Some(rest) = message.strip_prefix(token) {
            return ParsedCommand {
                is_command: true,
                command: token.to_string(),
                args: rest.trim().to_string(),
            };
        }
    }
    ParsedCommand::default()
}

fn instruction(command: Command) -> &'static str {
    match command {
        Command::Explain => "Explain what the following code does.",
        Command::Refactor => {
            "Refactor the following code to improve its structure and readability without changing its behavior."
        }
        Command::Optimize => "Optimize the following code for performance.",
        Command::Document => "Add clear documentation comments to the following code.",
        Command::Fix => "Find and fix the bugs in the following code.",
        Command::Test => "Write unit tests for the following code.",
        Command::Help | Command::Search | Command::Open => "",
    }
}

/// Render the model prompt for a code command.
///
/// `/explain` asks for prose only. Mutating commands ask for the full modified
/// code in one fenced block followed by an explanation.
pub fn build_prompt(command: Command, args: &str, code: &str, language: &str) -> String {
    let mut prompt = String::from(instruction(command));
    if !args.is_empty() {
        prompt.push_str("\nAdditional instructions: ");
        prompt.push_str(args);
    }
    prompt.push_str(&format!("\n\n```{language}\n{code}"));
    if !code.ends_with('\n') {
        prompt.push('\n');
    }
    prompt.push_str("```\n\n");

    if command.is_mutating() {
        prompt.push_str(&format!(
            "Return the complete modified code in a single ```{language} fenced block, \
             then explain the changes you made. Do not split the code across several blocks."
        ));
    } else {
        prompt.push_str("Explain only. Do not rewrite or return modified code.");
    }
    prompt
}

/// `/help` output.
pub fn help_text() -> String {
    let mut out = String::from("Available commands:\n");
    for (token, desc) in COMMANDS {
        out.push_str(&format!("  {token:<10} {desc}\n"));
    }
    out.push_str("\nAnything else is sent to the assistant as a chat message.");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── parse_command ──

    #[test]
    fn parses_command_with_args() {
        let parsed = parse_command("/explain some code");
        assert_eq!(
            (parsed.is_command, parsed.command.as_str(), parsed.args.as_str()),
            (true, "/explain", "some code")
        );
        assert_eq!(parsed.kind(), Some(Command::Explain));
    }

    #[test]
    fn chat_input_is_not_a_command() {
        let parsed = parse_command("hello world");
        assert_eq!(
            (parsed.is_command, parsed.command.as_str(), parsed.args.as_str()),
            (false, "", "")
        );
        assert_eq!(parsed.kind(), None);
    }

    #[test]
    fn args_are_trimmed() {
        let parsed = parse_command("  /fix    the off-by-one   ");
        assert_eq!(parsed.command, "/fix");
        assert_eq!(parsed.args, "the off-by-one");
    }

    #[test]
    fn bare_command_has_empty_args() {
        let parsed = parse_command("/help");
        assert!(parsed.is_command);
        assert_eq!(parsed.args, "");
    }

    #[test]
    fn unknown_slash_is_chat() {
        assert!(!parse_command("/deploy now").is_command);
    }

    #[test]
    fn prefix_match_first_token_wins() {
        let parsed = parse_command("/testing");
        assert_eq!(parsed.command, "/test");
        assert_eq!(parsed.args, "ing");
    }

    // ── Command ──

    #[test]
    fn table_and_enum_agree() {
        assert_eq!(COMMANDS.len(), Command::ALL.len());
        for cmd in Command::ALL {
            assert_eq!(Command::from_token(cmd.token()), Some(cmd));
            assert!(!cmd.description().is_empty());
        }
    }

    #[test]
    fn mutating_classification() {
        assert!(!Command::Explain.is_mutating());
        assert!(Command::Refactor.is_mutating());
        assert!(Command::Test.is_mutating());
        assert!(Command::Search.is_local());
        assert!(!Command::Fix.is_local());
    }

    // ── build_prompt ──

    #[test]
    fn explain_prompt_is_read_only() {
        let prompt = build_prompt(Command::Explain, "", "x = 1", "python");
        assert!(prompt.contains("```python\nx = 1\n```"));
        assert!(prompt.contains("Explain only"));
        assert!(!prompt.contains("complete modified code"));
    }

    #[test]
    fn mutating_prompt_asks_for_single_block() {
        let prompt = build_prompt(Command::Refactor, "use iterators", "fn f() {}\n", "rust");
        assert!(prompt.starts_with("Refactor"));
        assert!(prompt.contains("Additional instructions: use iterators"));
        assert!(prompt.contains("```rust\nfn f() {}\n```"));
        assert!(prompt.contains("single ```rust fenced block"));
    }

    #[test]
    fn help_lists_every_command() {
        let help = help_text();
        for (token, _) in COMMANDS {
            assert!(help.contains(token));
        }
    }
}
