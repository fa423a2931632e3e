mod cli;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::warn;

use cli::{Cli, Command, RunArgs};
use enhance_flow::{
    BatchDispatcher, Collaborators, EnhanceConfig, FileJournal, HttpTransformer, ItemWorkflow,
    Journal, LocalScratch, LocalStorage, StepExecutor, cancellation, logging, ui,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let show_progress = match &cli.command {
        Command::Run(args) => args.show_progress(),
        Command::Status => false,
    };
    let level = cli
        .log_level
        .as_deref()
        .unwrap_or_else(|| logging::default_level(show_progress));
    logging::init(level);

    let config = EnhanceConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run(args) => run_batch(config, args).await,
        Command::Status => show_status(&config).await,
    }
}

async fn run_batch(mut config: EnhanceConfig, args: RunArgs) -> Result<ExitCode> {
    // CLI flags win over the file and the environment.
    if let Some(images) = args.images.clone() {
        config.images = Some(images);
    }
    if let Some(max) = args.max_concurrent {
        config.max_concurrent_workflows = max;
    }
    if let Some(prompt) = args.enhancement_prompt.clone() {
        config.enhancement_prompt = prompt;
    }

    let items = config
        .batch_input()?
        .into_work_items(&config.enhancement_prompt);

    let journal = Arc::new(FileJournal::new(&config.paths.journal_dir));
    if args.fresh {
        for item in &items {
            journal.discard(&item.id).await?;
        }
    }

    let collaborators = Collaborators {
        storage: Arc::new(LocalStorage::new(&config.paths.storage_root)),
        transformer: Arc::new(HttpTransformer::new(
            config.transform.endpoint.clone(),
            config.transform.api_key.clone(),
        )?),
        scratch: Arc::new(LocalScratch::new(&config.paths.scratch_dir)),
    };
    let workflow = ItemWorkflow::new(
        StepExecutor::new(collaborators),
        config.step_policies(),
        config.step_timeouts(),
        journal,
    );

    let (handle, signal) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling batch");
            handle.cancel();
        }
    });

    let mut dispatcher = BatchDispatcher::new(workflow).with_cancel(signal);
    if args.show_progress() {
        dispatcher = dispatcher.with_reporter(Arc::new(ui::BatchProgress::new()));
    }

    let batch = dispatcher
        .run(items, config.max_concurrent_workflows)
        .await?;
    ui::print_summary(&batch);

    Ok(if batch.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn show_status(config: &EnhanceConfig) -> Result<ExitCode> {
    let journal = FileJournal::new(&config.paths.journal_dir);
    let mut states = Vec::new();
    for id in journal.item_ids().await? {
        let entries = journal.replay(&id).await?;
        if let Some(wf) = enhance_flow::journal::recover(&id, &entries)? {
            states.push(wf);
        }
    }
    ui::print_status(&states);
    Ok(ExitCode::SUCCESS)
}
