use std::io::Write;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use rust_decimal::Decimal;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use llm_gateway::app::{AppConfig, AppState, StorageMode};
use llm_gateway::chat::{ChatOutcome, ChatRequest, MeteredStream};
use llm_gateway::cli::{AccountArgs, Cli, Commands};
use llm_gateway::models::pricing::pricing_for;
use llm_gateway::models::{ChatMessage, ChatStream, ModelId, ModelSelectionContext};
use llm_gateway::platform::AppPaths;
use llm_gateway::quota::{QuotaSubject, UserTier};

fn init_logging(paths: &AppPaths, debug: bool) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let default_level = if debug { "llm_gateway=debug" } else { "llm_gateway=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file_appender = tracing_appender::rolling::daily(paths.logs_dir(), "gateway.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file_writer))
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;

    Ok(guard)
}

fn subject(account: &AccountArgs) -> QuotaSubject {
    let subject = QuotaSubject::new(account.user.clone());
    match &account.org {
        Some(org) => subject.with_org(org.clone()),
        None => subject,
    }
}

fn parse_tier(value: &str) -> anyhow::Result<UserTier> {
    UserTier::ALL
        .into_iter()
        .find(|tier| tier.as_str().eq_ignore_ascii_case(value.trim()))
        .ok_or_else(|| anyhow!("Unknown tier '{}', expected one of free, pro, business, enterprise", value))
}

async fn stream_to_stdout(stream: &mut MeteredStream) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout();
    loop {
        let chunk = tokio::select! {
            chunk = stream.next_chunk() => chunk?,
            _ = tokio::signal::ctrl_c() => {
                if let Some(outcome) = stream.cancel().await {
                    eprintln!("\n[cancelled, partial usage recorded: {}]", outcome.recorded);
                } else {
                    eprintln!("\n[cancelled]");
                }
                return Ok(());
            }
        };
        let Some(chunk) = chunk else {
            break;
        };

        if !chunk.content.is_empty() {
            write!(stdout, "{}", chunk.content)?;
            stdout.flush()?;
        }
        for call in chunk.tool_calls.iter().flatten() {
            writeln!(stdout, "\n[tool call {} {}({})]", call.id, call.name, call.arguments_json)?;
        }
        if chunk.done {
            writeln!(stdout)?;
            let model = stream.active_model().map(|m| m.to_string()).unwrap_or_default();
            match chunk.usage {
                Some(usage) => eprintln!(
                    "[{}: {} input / {} output tokens]",
                    model, usage.input_tokens, usage.output_tokens
                ),
                None => eprintln!("[{}: usage not reported]", model),
            }
        }
    }
    Ok(())
}

async fn run_chat(
    state: &AppState,
    prompt: String,
    model: &str,
    system: Option<String>,
    account: &AccountArgs,
) -> anyhow::Result<()> {
    let model = ModelId::from_str(model)?;
    let mut messages = Vec::new();
    if let Some(system) = system {
        messages.push(ChatMessage::system(system));
    }
    messages.push(ChatMessage::user(prompt));

    let request = ChatRequest::new(subject(account), model, messages);
    match state.chat().start_chat(request).await? {
        ChatOutcome::Denied { model, result } => bail!(
            "Request for {} denied: {} (daily {}/{}, monthly {}/{})",
            model,
            result.reason.unwrap_or_else(|| "quota exceeded".to_string()),
            result.daily_used,
            result.daily_limit,
            result.monthly_used,
            result.monthly_limit
        ),
        ChatOutcome::Streaming(mut stream) => stream_to_stdout(&mut stream).await,
    }
}

struct RouteArgs {
    prompt: String,
    model: String,
    tier: Option<String>,
    code: bool,
    reasoning: bool,
    budget: Option<String>,
    account: AccountArgs,
}

async fn run_route(state: &AppState, args: RouteArgs) -> anyhow::Result<()> {
    let model = ModelId::from_str(&args.model)?;
    let tier = match args.tier.as_deref() {
        Some(tier) => parse_tier(tier)?,
        None => state.chat().resolve_tier(&args.account.user).await,
    };
    let budget = args
        .budget
        .as_deref()
        .map(Decimal::from_str)
        .transpose()
        .context("Budget must be a number of cents")?;

    let context = ModelSelectionContext {
        is_code_task: args.code,
        requires_reasoning: args.reasoning,
        max_budget_cents_per_mtok: budget,
        ..ModelSelectionContext::default()
    };
    let messages = vec![ChatMessage::user(args.prompt)];

    let router = state.router();
    let resolved = router.resolve_model(model, &messages, &[], tier, Some(&context));
    let plan = router.plan(resolved, tier);

    println!("tier:     {}", tier);
    println!("selected: {}", resolved);
    println!("chain:");
    for candidate in plan.chain.models() {
        let status = if plan.excluded.contains(candidate) {
            "not in tier"
        } else if router.registry().is_model_available(*candidate) {
            "available"
        } else {
            "no credentials"
        };
        println!("  {:<18} {}", candidate.as_str(), status);
    }
    Ok(())
}

fn run_models(state: &AppState, available_only: bool) {
    println!(
        "{:<18} {:<13} {:>10} {:>10} {:>10}  {}",
        "model", "provider", "in $/M", "out $/M", "context", "status"
    );
    for model in ModelId::CONCRETE {
        let available = state.registry().is_model_available(model);
        if available_only && !available {
            continue;
        }
        let Some(pricing) = pricing_for(model) else {
            continue;
        };
        let provider = model.provider().map(|p| p.to_string()).unwrap_or_default();
        println!(
            "{:<18} {:<13} {:>10} {:>10} {:>10}  {}",
            model.as_str(),
            provider,
            pricing.input_per_million,
            pricing.output_per_million,
            pricing.context_window,
            if available { "available" } else { "unavailable" }
        );
    }
}

async fn run_quota(state: &AppState, account: &AccountArgs) -> anyhow::Result<()> {
    let subject = subject(account);
    let snapshot = state.quota().store().get_or_create_quota(&subject.user_id).await?;
    let summary = state.quota().metering().usage_summary(subject.billing_account()).await?;

    println!("user:     {}", snapshot.user_id);
    println!("tier:     {}", snapshot.tier);
    println!("daily:    {}/{}", snapshot.daily_used, snapshot.daily_limit);
    println!("monthly:  {}/{}", snapshot.monthly_used, snapshot.monthly_limit);
    println!("overage:  {}", if snapshot.overage_enabled { "enabled" } else { "disabled" });
    println!(
        "models:   {}",
        snapshot.allowed_models.iter().map(|m| m.as_str()).collect::<Vec<_>>().join(", ")
    );
    println!(
        "billing:  {} in {}: {} tokens ({} premium), overage {} tokens / ${}",
        summary.org_id,
        summary.period,
        summary.total_tokens,
        summary.premium_tokens,
        summary.overage_tokens,
        summary.overage_cost
    );
    Ok(())
}

async fn run_account(
    state: &AppState,
    account: &AccountArgs,
    tier: Option<String>,
    overage: Option<bool>,
) -> anyhow::Result<()> {
    if tier.is_none() && overage.is_none() {
        bail!("Nothing to change: pass --tier and/or --overage");
    }

    let store = state.quota().store();
    if let Some(tier) = tier {
        store.set_tier(&account.user, parse_tier(&tier)?).await?;
    }
    if let Some(enabled) = overage {
        store.set_overage_enabled(&account.user, enabled).await?;
    }
    run_quota(state, account).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = AppPaths::new()?;
    paths.ensure_dirs_exist()?;
    let _log_guard = init_logging(&paths, cli.debug)?;
    info!("Starting llm-gateway {}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path).await,
        None => AppConfig::load(&paths).await,
    }
    .context("Failed to load configuration")?;

    let mode = if cli.ephemeral { StorageMode::Memory } else { StorageMode::Sqlite };
    let (state, mut alerts) = AppState::new(config, paths, mode).await?;

    tokio::spawn(async move {
        while let Some(alert) = alerts.recv().await {
            warn!("Usage alert for {}: {}", alert.org_id, alert.message);
        }
    });

    let result = match cli.command {
        Commands::Chat { prompt, model, system, account } => {
            run_chat(&state, prompt.join(" "), &model, system, &account).await
        }
        Commands::Route { prompt, model, tier, code, reasoning, budget, account } => {
            run_route(
                &state,
                RouteArgs {
                    prompt: prompt.join(" "),
                    model,
                    tier,
                    code,
                    reasoning,
                    budget,
                    account,
                },
            )
            .await
        }
        Commands::Models { available } => {
            run_models(&state, available);
            Ok(())
        }
        Commands::Quota { account } => run_quota(&state, &account).await,
        Commands::Account { account, tier, overage } => run_account(&state, &account, tier, overage).await,
    };

    state.shutdown().await;
    result
}
