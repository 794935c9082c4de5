use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "llm-gateway")]
#[command(about = "Tier-aware LLM routing gateway with streaming fallback and token quotas")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Keep accounts in memory instead of the database
    #[arg(long, global = true)]
    pub ephemeral: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Stream a reply to stdout
    Chat {
        /// Prompt text
        #[arg(required = true, trailing_var_arg = true)]
        prompt: Vec<String>,

        /// Model name, or "auto" to let the gateway choose
        #[arg(short, long, default_value = "auto")]
        model: String,

        /// Optional system prompt
        #[arg(short, long)]
        system: Option<String>,

        #[command(flatten)]
        account: AccountArgs,
    },

    /// Show which model and fallback chain a prompt would get, without calling a provider
    Route {
        #[arg(required = true, trailing_var_arg = true)]
        prompt: Vec<String>,

        #[arg(short, long, default_value = "auto")]
        model: String,

        /// Route as this tier instead of the account's
        #[arg(short, long)]
        tier: Option<String>,

        /// Treat the request as a coding task
        #[arg(long)]
        code: bool,

        /// Treat the request as needing step-by-step reasoning
        #[arg(long)]
        reasoning: bool,

        /// Ceiling on blended price, in cents per million tokens
        #[arg(long)]
        budget: Option<String>,

        #[command(flatten)]
        account: AccountArgs,
    },

    /// List the model catalog with pricing and availability
    Models {
        /// Show only models with a configured provider
        #[arg(short, long)]
        available: bool,
    },

    /// Show an account's tier, limits and usage
    Quota {
        #[command(flatten)]
        account: AccountArgs,
    },

    /// Change an account's tier or overage setting
    Account {
        #[command(flatten)]
        account: AccountArgs,

        /// New tier (free, pro, business, enterprise)
        #[arg(short, long)]
        tier: Option<String>,

        /// Allow usage beyond the plan limits to be billed
        #[arg(long)]
        overage: Option<bool>,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct AccountArgs {
    /// User the request is made for
    #[arg(short, long, default_value = "local")]
    pub user: String,

    /// Organization billed for the usage
    #[arg(long)]
    pub org: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_collects_prompt_words() {
        let cli = Cli::parse_from(["llm-gateway", "--ephemeral", "chat", "-m", "gpt-4o", "hello", "there"]);
        assert!(cli.ephemeral);
        match cli.command {
            Commands::Chat { prompt, model, account, .. } => {
                assert_eq!(prompt.join(" "), "hello there");
                assert_eq!(model, "gpt-4o");
                assert_eq!(account.user, "local");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_account_flags() {
        let cli = Cli::parse_from(["llm-gateway", "account", "--user", "ana", "--tier", "pro", "--overage", "true"]);
        match cli.command {
            Commands::Account { account, tier, overage } => {
                assert_eq!(account.user, "ana");
                assert_eq!(tier.as_deref(), Some("pro"));
                assert_eq!(overage, Some(true));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
