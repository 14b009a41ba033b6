//! xreply - X interaction pipeline CLI
//!
//! Main entry point for the xreply command-line tool.

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use colored::Colorize;
use std::io;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use xreply::actions::ActionProcessor;
use xreply::config::{PlannerKind, WarehouseKind};
use xreply::logging::init_cli_logging;
use xreply::posting::PostPublisher;
use xreply::scheduler::Scheduler;
use xreply::thread::ThreadBuilder;
use xreply::warehouse::{HttpWarehouse, SqliteWarehouse, Warehouse};
use xreply::*;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<XrError>() {
                Some(xr) => eprintln!("{}", format_xr_error(xr)),
                None => eprintln!("{} {err:#}", "✗".red().bold()),
            }
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    if let Commands::Completions(args) = &cli.command {
        let mut cmd = Cli::command();
        generate(args.shell, &mut cmd, "xreply", &mut io::stdout());
        return Ok(());
    }

    // --init writes the file that --config names, so it may not exist yet.
    let explicit = match &cli.command {
        Commands::Config(args) if args.init => None,
        _ => cli.config.as_deref(),
    };
    let mut config = Config::load(explicit)?;
    if let Some(db) = &cli.db {
        config.storage.db = Some(db.clone());
    }
    init_cli_logging(cli.quiet, cli.verbose, &config.logging);

    match &cli.command {
        Commands::Run(args) => cmd_run(config, args.dry_run).await,
        Commands::Poll(args) => cmd_poll(config, args).await,
        Commands::Plan(args) => cmd_plan(&config, args).await,
        Commands::Thread(args) => cmd_thread(&config, args).await,
        Commands::Token(args) => cmd_token(&config, args).await,
        Commands::Search(args) => cmd_search(&config, args).await,
        Commands::Config(args) => cmd_config(&cli, &config, args),
        Commands::Completions(_) => Ok(()),
    }
}

// =============================================================================
// Builders
// =============================================================================

fn build_channel(config: &Config) -> Result<Arc<dyn SocialChannel>> {
    if let Some(fixture) = &config.channel.fixture {
        info!(fixture = %fixture.display(), "serving channel from fixture");
        return Ok(Arc::new(InMemoryChannel::from_fixture_file(fixture)?));
    }
    let token = config
        .channel
        .bearer_token
        .clone()
        .ok_or(XrError::MissingSetting {
            field: "channel.bearer_token",
        })?;
    Ok(Arc::new(XApiChannel::new(
        &config.channel.api_base,
        token,
        Duration::from_secs(config.channel.timeout_secs),
    )?))
}

fn build_generator(config: &Config) -> Result<Arc<dyn TextGenerator>> {
    let llm = &config.llm;
    let generator = OpenAiGenerator::new(
        &llm.endpoint,
        llm.api_key.clone(),
        &llm.small_model,
        &llm.large_model,
        Duration::from_secs(llm.timeout_secs),
    )?
    .with_temperature(llm.temperature);
    Ok(Arc::new(generator))
}

fn build_queries(
    config: &Config,
    generator: Option<Arc<dyn TextGenerator>>,
) -> Result<Arc<dyn QueryEngine>> {
    let web = build_web_search(config)?;
    Ok(match config.warehouse.kind {
        WarehouseKind::Sqlite => Arc::new(attach_web_search(
            AnalyticsService::from_config(SqliteWarehouse::new(config.warehouse_path()), config, generator),
            web,
        )),
        WarehouseKind::Http => Arc::new(attach_web_search(
            AnalyticsService::from_config(http_warehouse(config)?, config, generator),
            web,
        )),
    })
}

fn build_web_search(config: &Config) -> Result<Option<Arc<dyn WebSearch>>> {
    if config.search.api_key.is_none() {
        return Ok(None);
    }
    Ok(Some(Arc::new(TavilySearch::from_config(&config.search)?)))
}

fn attach_web_search<W: Warehouse>(
    service: AnalyticsService<W>,
    web: Option<Arc<dyn WebSearch>>,
) -> AnalyticsService<W> {
    match web {
        Some(provider) => service.with_web_search(provider),
        None => service,
    }
}

fn http_warehouse(config: &Config) -> Result<HttpWarehouse> {
    let url = config
        .warehouse
        .url
        .clone()
        .ok_or(XrError::MissingSetting {
            field: "warehouse.url",
        })?;
    Ok(HttpWarehouse::new(
        url,
        config.warehouse.api_key.clone(),
        Duration::from_secs(config.warehouse.timeout_secs),
    )?)
}

fn open_memory(config: &Config) -> Result<Arc<dyn MemoryStore>> {
    Ok(Arc::new(SqliteMemoryStore::open(config.db_path())?))
}

async fn build_agent(config: &Config) -> Result<AgentContext> {
    config.validate()?;
    let channel = build_channel(config)?;
    let generator = build_generator(config)?;
    let queries = build_queries(config, Some(Arc::clone(&generator)))?;
    let memory = open_memory(config)?;

    let profile = channel.profile().await?;
    if let Some(username) = &config.channel.username {
        if !username.eq_ignore_ascii_case(&profile.handle) {
            warn!(configured = %username, actual = %profile.handle, "configured username differs from account");
        }
    }
    let agent_id = config
        .channel
        .agent_id
        .clone()
        .unwrap_or_else(|| profile.id.clone());
    info!(handle = %profile.handle, agent_id = %agent_id, "agent ready");

    Ok(AgentContext {
        channel,
        memory,
        generator,
        queries,
        profile,
        agent_id,
    })
}

// =============================================================================
// Commands
// =============================================================================

async fn cmd_run(config: Config, dry_run: bool) -> Result<()> {
    let agent = build_agent(&config).await?;
    let dry_run = dry_run || config.interactions.dry_run;

    let mut interaction_settings = config.interactions.clone();
    interaction_settings.dry_run = dry_run;
    let interactions = Arc::new(InteractionClient::new(agent.clone(), interaction_settings));

    let cancel = CancellationToken::new();
    let mut scheduler = Scheduler::new(
        interactions,
        Duration::from_secs(config.interactions.poll_interval_secs),
        cancel.clone(),
    );
    if config.posting.enabled {
        let publisher = PostPublisher::new(agent.clone(), config.posting.clone(), dry_run);
        scheduler = scheduler.with_publisher(Arc::new(publisher), config.posting.post_immediately);
    }
    if config.actions.enabled {
        let processor = ActionProcessor::new(
            agent.clone(),
            config.actions.clone(),
            config.interactions.max_reply_length,
            dry_run,
        );
        scheduler = scheduler.with_actions(
            Arc::new(processor),
            Duration::from_secs(config.actions.interval_secs),
        );
    }

    println!(
        "{} @{}{}",
        "xreply running as".bold().cyan(),
        agent.handle(),
        if dry_run { " (dry run)".yellow().to_string() } else { String::new() }
    );

    let signal_token = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("ctrl-c received; shutting down");
                signal_token.cancel();
            }
            Err(e) => warn!(error = %e, "cannot listen for ctrl-c"),
        }
    });

    scheduler.run().await;
    agent.queries.close().await;
    println!("{}", "Stopped.".dimmed());
    Ok(())
}

async fn cmd_poll(mut config: Config, args: &PollArgs) -> Result<()> {
    config.interactions.dry_run |= args.dry_run;
    let agent = build_agent(&config).await?;
    let client = InteractionClient::new(agent.clone(), config.interactions.clone());

    let summary = client.handle_interactions().await;
    agent.queries.close().await;
    let summary = summary?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("{}", "Interaction pass".bold().cyan());
    println!("  {:<14} {}", "Discovered:", summary.discovered);
    println!("  {:<14} {}", "Processed:", summary.processed);
    println!("  {:<14} {}", "Skipped:", summary.skipped);
    println!("  {:<14} {}", "Responded:", summary.responded.to_string().green());
    if summary.failed > 0 {
        println!("  {:<14} {}", "Failed:", summary.failed.to_string().red());
    }
    if let Some(last) = &summary.last_checked {
        println!("  {:<14} {}", "Last checked:", last.dimmed());
    }
    Ok(())
}

async fn cmd_plan(config: &Config, args: &PlanArgs) -> Result<()> {
    config.validate()?;
    let generator = match config.query.planner {
        PlannerKind::Llm => Some(build_generator(config)?),
        PlannerKind::Rules => None,
    };
    match config.warehouse.kind {
        WarehouseKind::Sqlite => {
            let warehouse = SqliteWarehouse::new(config.warehouse_path());
            plan_with(AnalyticsService::from_config(warehouse, config, generator), args).await
        }
        WarehouseKind::Http => {
            let warehouse = http_warehouse(config)?;
            plan_with(AnalyticsService::from_config(warehouse, config, generator), args).await
        }
    }
}

async fn plan_with<W: Warehouse>(service: AnalyticsService<W>, args: &PlanArgs) -> Result<()> {
    let prepared = service.prepare(&args.question, &args.context).await;
    println!("{}", prepared.sql);

    if args.execute {
        let rows = service.execute(&prepared).await;
        service.shutdown().await;
        println!("{}", serde_json::to_string_pretty(&rows?)?);
    }
    Ok(())
}

async fn cmd_thread(config: &Config, args: &ThreadArgs) -> Result<()> {
    let channel = build_channel(config)?;
    let memory = open_memory(config)?;
    let profile = channel.profile().await?;
    let agent_id = config
        .channel
        .agent_id
        .clone()
        .unwrap_or_else(|| profile.id.clone());

    let leaf = channel
        .get_post(&args.id)
        .await?
        .ok_or_else(|| XrError::not_found("post", &args.id))?;
    let depth = args.depth.unwrap_or(config.interactions.max_thread_depth);
    let builder = ThreadBuilder::new(Arc::clone(&channel), memory, agent_id, &profile.id);
    let thread = builder.build_thread(&leaf, depth).await;

    println!("{}", "─".repeat(CONTENT_DIVIDER_WIDTH));
    for post in thread.posts() {
        println!(
            "{} {}",
            format!("@{}", post.author_handle).green(),
            format_short_id(&post.id).dimmed()
        );
        println!("{}", post.text);
        println!("{}", "─".repeat(CONTENT_DIVIDER_WIDTH));
    }
    println!("{} posts", thread.len());
    Ok(())
}

async fn cmd_token(config: &Config, args: &TokenArgs) -> Result<()> {
    config.validate()?;
    let queries = build_queries(config, None)?;
    let found = if args.search {
        queries.search_tokens(&args.name).await
    } else {
        queries
            .token_metrics(&args.name)
            .await
            .map(|metrics| metrics.into_iter().collect::<Vec<_>>())
    };
    queries.close().await;
    let found = found?;

    if found.is_empty() {
        return Err(XrError::not_found("token", &args.name).into());
    }
    if args.json {
        println!("{}", serde_json::to_string_pretty(&found)?);
        return Ok(());
    }

    for (n, metrics) in found.iter().enumerate() {
        if n > 0 {
            println!("{}", "─".repeat(CONTENT_DIVIDER_WIDTH));
        }
        print!("{}", format_token_metrics(metrics));
    }
    Ok(())
}

async fn cmd_search(config: &Config, args: &SearchArgs) -> Result<()> {
    config.validate()?;
    let queries = build_queries(config, None)?;
    let results = queries.web_search(&args.query).await;
    queries.close().await;
    let results = results?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else if results.is_empty() {
        println!("{}", "No search results found".dimmed());
    } else {
        println!("{}", format_search_results(&results));
    }
    Ok(())
}

fn cmd_config(cli: &Cli, config: &Config, args: &ConfigArgs) -> Result<()> {
    if args.path {
        match Config::user_config_path() {
            Some(path) => println!("{}", path.display()),
            None => anyhow::bail!("could not determine config directory"),
        }
    }

    if args.init {
        let target = cli.config.clone().or_else(Config::user_config_path);
        if let Some(path) = &target {
            if path.exists() && !args.force {
                anyhow::bail!(
                    "config file already exists: {} (use --force to overwrite)",
                    path.display()
                );
            }
        }
        let written = Config::default().save(target.as_deref())?;
        println!("{} {}", "Wrote".green(), written.display());
    }

    if args.show || !(args.path || args.init) {
        show_config(config)?;
    }
    Ok(())
}

fn show_config(config: &Config) -> Result<()> {
    let mut shown = config.clone();
    redact(&mut shown.channel.bearer_token);
    redact(&mut shown.llm.api_key);
    redact(&mut shown.warehouse.api_key);
    redact(&mut shown.search.api_key);
    let content = toml::to_string_pretty(&shown)?;

    println!("{}", "Current Configuration".bold().cyan());
    println!("  Database: {}", config.db_path().display());
    println!("{}", "─".repeat(CONTENT_DIVIDER_WIDTH));
    println!("{content}");
    Ok(())
}

fn redact(secret: &mut Option<String>) {
    if secret.is_some() {
        *secret = Some("********".to_string());
    }
}
