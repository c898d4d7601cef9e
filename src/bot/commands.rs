use teloxide::utils::command::BotCommands;

#[derive(BotCommands, Clone, Debug, PartialEq)]
#[command(rename_rule = "lowercase", description = "These commands are supported:")]
pub enum Command {
    #[command(description = "Start the bot")]
    Start,
    #[command(description = "Display help")]
    Help,
    #[command(description = "Ask Gemini something")]
    Ask(String),
    #[command(description = "Generate an image from a prompt")]
    Image(String),
    #[command(description = "Chart your daily usage")]
    Chart,
    #[command(description = "Show your usage stats")]
    Stats,
    #[command(description = "Pick the model used for your questions")]
    Model,
    #[command(description = "Forget this chat's conversation history")]
    Clear,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("/start", "gbot").unwrap(), Command::Start);
        assert_eq!(
            Command::parse("/ask what is rust?", "gbot").unwrap(),
            Command::Ask("what is rust?".to_string())
        );
        assert_eq!(
            Command::parse("/image@gbot a red fox", "gbot").unwrap(),
            Command::Image("a red fox".to_string())
        );
    }

    #[test]
    fn test_unknown_command_falls_through() {
        assert!(Command::parse("/frobnicate", "gbot").is_err());
        assert!(Command::parse("hello there", "gbot").is_err());
        assert!(Command::parse("/start@otherbot", "gbot").is_err());
    }

    #[test]
    fn test_help_lists_commands() {
        let help = Command::descriptions().to_string();
        for name in ["/start", "/ask", "/image", "/chart", "/stats", "/model", "/clear"] {
            assert!(help.contains(name), "missing {name} in help");
        }
    }
}
