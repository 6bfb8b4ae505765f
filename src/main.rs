use bulk_dispatch::adapters::tabular::{load_source, write_failures_csv};
use bulk_dispatch::adapters::whatsapp::mime_type_for_file;
use bulk_dispatch::core::engine::header_media_kind;
use bulk_dispatch::core::extractor::single_recipient;
use bulk_dispatch::domain::model::{DispatchOutcome, HeaderParam, TemplateInfo};
use bulk_dispatch::utils::error::{DispatchError, ErrorSeverity, Result};
use bulk_dispatch::utils::{logger, validation::Validate};
use bulk_dispatch::{
    AppConfig, CliConfig, DispatchEngine, DispatchReport, LocalStorage, RecipientBatch, Storage,
    TemplateMessage, WhatsAppClient,
};
use clap::Parser;
use std::collections::BTreeMap;
use std::sync::Arc;

const SINGLE_RECIPIENT_GROUP: &str = "Single";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = CliConfig::parse();

    if config.log_json {
        logger::init_json_logger(config.verbose);
    } else {
        logger::init_cli_logger(config.verbose);
    }

    tracing::info!("🚀 Starting bulk-dispatch");
    tracing::debug!("CLI config: {:?}", config);

    match run(&config).await {
        Ok(Some(report)) => {
            if config.fail_on_error && report.failed > 0 {
                std::process::exit(2);
            }
        }
        Ok(None) => {}
        Err(e) => {
            tracing::error!("❌ Dispatch failed: {} (Severity: {:?})", e, e.severity());
            eprintln!("❌ {}", e.user_friendly_message());

            let exit_code = match e.severity() {
                ErrorSeverity::Low => 0,
                ErrorSeverity::Medium => 2,
                ErrorSeverity::High => 1,
                ErrorSeverity::Critical => 3,
            };
            if exit_code > 0 {
                std::process::exit(exit_code);
            }
        }
    }

    Ok(())
}

/// Returns `None` for a dry run.
async fn run(cli: &CliConfig) -> Result<Option<DispatchReport>> {
    cli.validate()?;

    let file = AppConfig::from_file(&cli.config)?;
    file.validate()?;
    let (account_name, account) = file.account(cli.account.as_deref())?;
    tracing::info!("📁 Configuration loaded from {} (account: {})", cli.config, account_name);

    let client = WhatsAppClient::new(
        file.base_url(),
        file.api_version(),
        account.credentials(),
        file.request_timeout(),
    )?;
    let engine = DispatchEngine::new(Arc::new(client), cli.dispatch_settings(&file));
    let storage = LocalStorage::default();

    let template = engine.resolve_template(&cli.template).await?;
    tracing::info!(
        template = %template.name,
        language = %template.language,
        header = ?template.header_kind,
        variables = template.body_variable_count,
        "Template resolved"
    );

    let recipients = load_recipients(cli, &file, &storage).await?;
    let media = match &cli.header_media {
        Some(path) => Some((
            storage.read_file(path).await?,
            mime_type_for_file(path)?.to_string(),
        )),
        None => None,
    };

    if cli.dry_run {
        let kind = header_media_kind(&template, media.as_ref().map(|(_, mime)| mime.as_str()))?;
        let header = kind.map(|kind| HeaderParam {
            kind,
            media_id: "(not uploaded)".to_string(),
        });
        let message = TemplateMessage::for_template(&template, header, cli.vars.clone())?;
        let tasks = engine.plan(Arc::new(message), &recipients)?;
        print_plan(&template, &recipients, tasks.len());
        return Ok(None);
    }

    let header = engine.prepare_header(&template, media).await?;
    let message = TemplateMessage::for_template(&template, header, cli.vars.clone())?;
    let mut run = engine.start(message, &recipients)?;

    let token = run.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling unsent messages");
            token.cancel();
        }
    });

    let step = (run.total() / 20).max(1);
    while let Some(outcome) = run.next_outcome().await? {
        if let DispatchOutcome::Failure(failure) = &outcome {
            tracing::debug!(
                recipient = %failure.recipient,
                group = %failure.group,
                kind = %failure.kind,
                attempts = failure.attempts,
                "{}",
                failure.detail
            );
        }
        let snapshot = run.snapshot();
        if snapshot.completed % step == 0 || snapshot.is_complete() {
            tracing::info!("{}", snapshot);
        }
    }

    let report = run.finish().await?;
    print_summary(&report);
    write_outputs(cli, &storage, &report).await?;
    Ok(Some(report))
}

async fn load_recipients(
    cli: &CliConfig,
    file: &AppConfig,
    storage: &LocalStorage,
) -> Result<RecipientBatch> {
    match (&cli.phone, &cli.recipients) {
        (Some(phone), _) => single_recipient(SINGLE_RECIPIENT_GROUP, phone),
        (None, Some(path)) => {
            let source = load_source(storage, path).await?;
            let batch = file.extractor().extract(&source);
            for group in batch.groups() {
                tracing::info!(group = %group.label, recipients = group.recipients.len(), "Recipients extracted");
            }
            Ok(batch)
        }
        (None, None) => Err(DispatchError::MissingConfigError {
            field: "recipients".to_string(),
        }),
    }
}

fn print_plan(template: &TemplateInfo, recipients: &RecipientBatch, sends: usize) {
    println!("🔍 Dry run: nothing was sent");
    println!("   Template: {} ({})", template.name, template.language);
    for group in recipients.groups() {
        println!("   Group {}: {} recipients", group.label, group.recipients.len());
    }
    println!("   Messages to send after de-duplication: {}", sends);
}

fn print_summary(report: &DispatchReport) {
    println!(
        "✅ Dispatch finished in {:.1}s",
        report.elapsed().num_milliseconds() as f64 / 1000.0
    );
    println!("   Sent: {} | Failed: {} | Total: {}", report.succeeded, report.failed, report.total);

    if report.failures.is_empty() {
        return;
    }
    let mut by_kind: BTreeMap<String, usize> = BTreeMap::new();
    for failure in &report.failures {
        *by_kind.entry(failure.kind.to_string()).or_default() += 1;
    }
    for (kind, count) in by_kind {
        println!("   {}: {}", kind, count);
    }
    let retryable = report.retry_candidates().len();
    if retryable > 0 {
        println!("💡 {} failed recipients can be retried", retryable);
    }
}

async fn write_outputs(cli: &CliConfig, storage: &LocalStorage, report: &DispatchReport) -> Result<()> {
    if let Some(path) = &cli.failed_output {
        if report.failures.is_empty() {
            tracing::info!("No failed recipients, skipping {}", path);
        } else {
            storage
                .write_file(path, &write_failures_csv(&report.failures)?)
                .await?;
            println!("📁 Failed numbers saved to: {}", path);
        }
    }

    if let Some(path) = &cli.report {
        storage
            .write_file(path, &serde_json::to_vec_pretty(report)?)
            .await?;
        println!("📁 Report saved to: {}", path);
    }
    Ok(())
}
