/*
 * rescenter - Resource aggregation and transaction engine for software centers.
 * Copyright (C) 2025  compiledkernel-idk and rescenter contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use comfy_table::presets::UTF8_FULL;
use comfy_table::Table;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rescenter::backends;
use rescenter::export::Exporter;
use rescenter::logging;
use rescenter::{
    Config, ErrorContext, Filter, ResourceKey, ResourceRef, ResourceState, ResourcesModel, Transaction,
    TransactionStatus, UpdatesOrchestrator,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "\n",
    "Copyright (C) 2025  compiledkernel-idk and rescenter contributors\n",
    "License GPLv3+: GNU GPL version 3 or later <https://gnu.org/licenses/gpl.html>\n\n",
    "This is free software; you are free to change and redistribute it.\n",
    "There is NO WARRANTY, to the extent permitted by law."
);

/// How long commands wait for backends to finish their initial load
const LOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "rescenter")]
#[command(author = "rescenter contributors")]
#[command(version = VERSION)]
#[command(long_version = LONG_VERSION)]
#[command(about = "Search, install and update software from every configured source.")]
struct Cli {
    #[arg(short, long, global = true, help = "Read this config file on top of the defaults")]
    config: Option<PathBuf>,
    #[arg(short, long, global = true, help = "Debug logging")]
    verbose: bool,
    #[arg(short, long = "backend", global = true, help = "Only use these backends")]
    backends: Vec<String>,
    #[arg(long, global = true, help = "Bypass any confirmation prompts")]
    noconfirm: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Search every backend
    Search {
        #[arg(value_name = "TERMS")]
        terms: Vec<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        origin: Option<String>,
        #[arg(long)]
        installed: bool,
    },
    /// List installed resources
    List,
    /// Install resources, given as `id` or `backend:id`
    Install {
        #[arg(value_name = "TARGETS", required = true)]
        targets: Vec<String>,
    },
    /// Remove resources
    Remove {
        #[arg(value_name = "TARGETS", required = true)]
        targets: Vec<String>,
    },
    /// Show pending updates
    Updates,
    /// Apply every pending update
    Update,
    /// Write the full catalog as JSON
    Export {
        #[arg(value_name = "PATH")]
        path: Option<PathBuf>,
    },
    /// Show which backends this host supports
    Backends,
}

fn spinner(message: &str) -> Result<ProgressBar> {
    let spinner_style = ProgressStyle::default_spinner()
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
        .template("{spinner:.cyan} {msg}")?;
    let pb = ProgressBar::new_spinner();
    pb.set_style(spinner_style);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    Ok(pb)
}

fn format_size(bytes: u64) -> String {
    format!("{:.2} MiB", bytes as f64 / 1024.0 / 1024.0)
}

fn confirm(noconfirm: bool) -> Result<bool> {
    if noconfirm {
        return Ok(true);
    }
    use std::io::{self, Write};
    print!("\n{} proceed? [Y/n] ", style("::").bold().cyan());
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input).context("reading answer")?;
    let answer = input.trim().to_lowercase();
    Ok(answer.is_empty() || answer.starts_with('y'))
}

async fn load_model(config: &Config) -> Result<ResourcesModel> {
    let pb = spinner("loading backends...")?;
    let model = ResourcesModel::new(config.aggregation.clone());
    for backend in backends::available(&config.backends) {
        let name = backend.name().to_string();
        if let Err(e) = model.register_backend(backend) {
            logging::warn!(backend = %name, error = %e, "backend not registered");
        }
    }
    if model.backends().is_empty() {
        pb.finish_and_clear();
        return Err(anyhow!(
            "no usable backend (enabled: {})",
            config.backends.enabled.join(", ")
        ));
    }
    if tokio::time::timeout(LOAD_TIMEOUT, model.wait_until_idle()).await.is_err() {
        logging::warn!("backends still loading, continuing");
    }
    pb.finish_and_clear();
    Ok(model)
}

fn resource_table(resources: &[ResourceRef]) -> Table {
    let mut t = Table::new();
    t.load_preset(UTF8_FULL);
    t.set_header(vec!["name", "id", "version", "source", "state", "size"]);
    for r in resources {
        let info = r.info();
        let version = info
            .installed_version
            .or(info.available_version)
            .unwrap_or_else(|| "-".to_string());
        t.add_row(vec![
            info.name,
            r.id().to_string(),
            version,
            format!("{}/{}", r.backend(), info.origin),
            info.state.to_string(),
            format_size(info.size),
        ]);
    }
    t
}

async fn find_target(model: &ResourcesModel, target: &str) -> Result<ResourceRef> {
    if let Some((backend, id)) = target.split_once(':') {
        if model.backend(backend).is_some() {
            return model
                .resolve(&ResourceKey::new(backend, id))
                .ok_or_else(|| anyhow!("target not found: {}", target));
        }
    }
    let results = model.search(&Filter::new().with_search(target)).collect_all().await;
    let mut matches: Vec<ResourceRef> = results
        .into_iter()
        .map(|r| r.resource)
        .filter(|r| r.id() == target || r.name().eq_ignore_ascii_case(target))
        .collect();
    match matches.len() {
        0 => Err(anyhow!("target not found: {}", target)),
        1 => Ok(matches.remove(0)),
        _ => {
            let keys: Vec<String> = matches.iter().map(|r| r.key().to_string()).collect();
            Err(anyhow!("'{}' is ambiguous, use one of: {}", target, keys.join(", ")))
        }
    }
}

/// Follow a transaction until it ends; Ctrl-C asks it to cancel
async fn follow(transaction: Arc<Transaction>) -> Result<TransactionStatus> {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.cyan} {msg:24} [{bar:30.cyan/blue}] {pos:>3}%")?
            .progress_chars("=> "),
    );
    pb.enable_steady_tick(Duration::from_millis(80));

    let mut state = transaction.watch();
    let mut interrupted = false;
    loop {
        {
            let current = state.borrow_and_update();
            pb.set_position(current.progress as u64);
            pb.set_message(format!("{} {}", transaction.status_text(), transaction.name()));
            if current.status.is_terminal() {
                break;
            }
        }
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                if let Err(e) = transaction.cancel() {
                    pb.println(format!("{} {}", style("warning:").yellow().bold(), e));
                }
            }
        }
    }
    pb.finish_and_clear();

    let status = transaction.status();
    let label = match status {
        TransactionStatus::Done => style(status.to_string()).green(),
        TransactionStatus::Cancelled => style(status.to_string()).yellow(),
        _ => style(status.to_string()).red(),
    };
    println!("{} {} {}", style("::").bold().cyan(), transaction.name(), label);
    Ok(status)
}

async fn search(model: &ResourcesModel, config: &Config, filter: Filter) -> Result<()> {
    let mut results = model
        .search_with(&filter, config.aggregation.search_options())
        .collect_all()
        .await;
    if results.is_empty() {
        println!("no matches found.");
        return Ok(());
    }
    // Backends rank their own batches; merge them into one ranking
    results.sort_by(|a, b| b.sort_score.cmp(&a.sort_score));
    let resources: Vec<ResourceRef> = results.into_iter().map(|r| r.resource).collect();
    println!("{}", resource_table(&resources));
    Ok(())
}

async fn install_or_remove(model: &ResourcesModel, targets: &[String], install: bool, noconfirm: bool) -> Result<bool> {
    let mut resources = Vec::new();
    for target in targets {
        let resource = find_target(model, target).await?;
        if install && resource.is_installed() {
            println!("{} {} is already installed, skipping", style("::").bold().cyan(), resource.key());
            continue;
        }
        if !install && !resource.is_installed() {
            return Err(anyhow!("{} is not installed", resource.key()));
        }
        resources.push(resource);
    }
    if resources.is_empty() {
        println!("nothing to do.");
        return Ok(true);
    }

    let heading = if install {
        style("\nINSTALLATION").green().bold()
    } else {
        style("\nREMOVAL").red().bold()
    };
    println!("{}", heading);
    println!("{}", resource_table(&resources));
    if !confirm(noconfirm)? {
        return Ok(true);
    }

    let mut ok = true;
    for resource in &resources {
        let transaction = if install {
            model.install_application(resource, &Default::default())?
        } else {
            model.remove_application(resource)?
        };
        let mut messages = transaction.messages();
        let status = follow(transaction).await?;
        while let Ok(message) = messages.try_recv() {
            eprintln!("{} {}", style("error:").red().bold(), message);
        }
        ok &= status == TransactionStatus::Done;
    }
    Ok(ok)
}

async fn refresh_updates(orchestrator: &UpdatesOrchestrator) -> Result<()> {
    for updater in orchestrator.updaters() {
        if let Err(e) = updater.refresh().await {
            logging::warn!(backend = %updater.backend_name(), error = %e, "could not refresh updates");
        }
    }
    orchestrator.prepare()?;
    Ok(())
}

fn print_updates(orchestrator: &UpdatesOrchestrator) {
    let pending = orchestrator.to_update();
    println!("{}", style("\nUPDATES").green().bold());
    println!("{}", resource_table(&pending));
    println!("\nTotal Download:  {}", format_size(orchestrator.update_size()));
    if let Some(last) = orchestrator.last_update() {
        println!("Last Update:     {}", last.format("%Y-%m-%d %H:%M"));
    }
}

async fn update_all(model: &ResourcesModel, noconfirm: bool) -> Result<bool> {
    let orchestrator = UpdatesOrchestrator::new(model.clone());
    refresh_updates(&orchestrator).await?;
    if !orchestrator.has_updates() {
        println!("nothing to do.");
        return Ok(true);
    }
    print_updates(&orchestrator);
    if !confirm(noconfirm)? {
        return Ok(true);
    }

    let Some(transaction) = orchestrator.update_all()? else {
        println!("nothing to do.");
        return Ok(true);
    };
    let mut messages = transaction.messages();
    let status = follow(transaction).await?;
    while let Ok(message) = messages.try_recv() {
        eprintln!("{} {}", style("warning:").yellow().bold(), message);
    }
    if orchestrator.needs_reboot() {
        println!("{}", style(":: a reboot is required to finish the update").yellow().bold());
    }
    Ok(status == TransactionStatus::Done)
}

fn show_backends(config: &Config) {
    let mut t = Table::new();
    t.load_preset(UTF8_FULL);
    t.set_header(vec!["backend", "tool", "available", "enabled"]);
    for found in backends::detect(&config.backends) {
        t.add_row(vec![
            found.name.to_string(),
            found.program.unwrap_or("-").to_string(),
            if found.available { "yes" } else { "no" }.to_string(),
            if found.enabled { "yes" } else { "no" }.to_string(),
        ]);
    }
    println!("{}", t);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let Some(command) = cli.command else {
        use clap::CommandFactory;
        Cli::command().print_help()?;
        return Ok(());
    };

    let mut config = Config::load_with(cli.config.as_deref())?;
    if !cli.backends.is_empty() {
        config.backends.enabled = cli.backends.clone();
        config.validate()?;
    }
    logging::init_from_config(&config.logging, cli.verbose);
    console::set_colors_enabled(config.color);

    let ok = match command {
        Commands::Backends => {
            show_backends(&config);
            true
        }
        Commands::Search {
            terms,
            category,
            origin,
            installed,
        } => {
            let model = load_model(&config).await?;
            let mut filter = Filter::new();
            if !terms.is_empty() {
                filter = filter.with_search(terms.join(" "));
            }
            if let Some(category) = category {
                filter = filter.with_category(category);
            }
            if let Some(origin) = origin {
                filter = filter.with_origin(origin);
            }
            if installed {
                filter = filter.installed_only();
            }
            search(&model, &config, filter).await?;
            true
        }
        Commands::List => {
            let model = load_model(&config).await?;
            search(&model, &config, Filter::new().with_minimum_state(ResourceState::Installed)).await?;
            true
        }
        Commands::Install { targets } => {
            let model = load_model(&config).await?;
            install_or_remove(&model, &targets, true, cli.noconfirm).await?
        }
        Commands::Remove { targets } => {
            let model = load_model(&config).await?;
            install_or_remove(&model, &targets, false, cli.noconfirm).await?
        }
        Commands::Updates => {
            let model = load_model(&config).await?;
            let orchestrator = UpdatesOrchestrator::new(model);
            refresh_updates(&orchestrator).await?;
            if orchestrator.has_updates() {
                print_updates(&orchestrator);
            } else {
                println!("everything is up to date.");
            }
            true
        }
        Commands::Update => {
            let model = load_model(&config).await?;
            update_all(&model, cli.noconfirm).await?
        }
        Commands::Export { path } => {
            let model = load_model(&config).await?;
            let exporter = Exporter::new(model, &config);
            match path {
                Some(path) => {
                    let pb = spinner("exporting...")?;
                    let count = exporter.export_to(&path).await?;
                    pb.finish_and_clear();
                    println!("{} exported {} resources to {}", style("::").bold().cyan(), count, path.display());
                }
                None => println!("{}", exporter.to_json().await?),
            }
            true
        }
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
