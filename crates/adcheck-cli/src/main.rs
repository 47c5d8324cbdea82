use std::path::{Path, PathBuf};

use adcheck_contracts::categories::Category;
use adcheck_contracts::rules::RuleSet;
use adcheck_engine::{render, report_filename, ReviewConfig, ReviewEngine};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "adcheck-rs", version, about = "Brand-style review of promotional images")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Review one image against the enabled rule categories.
    Review(ReviewArgs),
    /// List the known categories and their reference files.
    Categories,
}

#[derive(Debug, Parser)]
struct ReviewArgs {
    /// Target image (PNG/JPEG).
    #[arg(long)]
    image: PathBuf,
    /// Comma-separated category ids.
    #[arg(long, default_value = "atm,logo,wording,format")]
    categories: String,
    /// Resolved rules file (JSON); omitted means no textual rules.
    #[arg(long)]
    rules: Option<PathBuf>,
    /// Report destination: a file path, or a directory to receive the
    /// timestamped default name.
    #[arg(long)]
    out: Option<PathBuf>,
    /// Events JSONL destination.
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value = "gemini-2.0-flash")]
    model: String,
    /// Directory holding the reference images.
    #[arg(long, default_value = "references")]
    references: PathBuf,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("adcheck-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Review(args) => run_review(args),
        Command::Categories => {
            print_categories();
            Ok(0)
        }
    }
}

fn run_review(args: ReviewArgs) -> Result<i32> {
    let enabled = parse_categories(&args.categories)?;
    let rules = match &args.rules {
        Some(path) => RuleSet::load(path)?,
        None => RuleSet::default(),
    };
    let mut config = ReviewConfig::from_env(&args.references)?;
    config.model = args.model.clone();

    let engine = ReviewEngine::new(config, args.events.as_deref());
    let report = engine.run(&args.image, &enabled, &rules)?;

    let generated_at = Utc::now();
    let source_name = args
        .image
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("image")
        .to_string();
    let rendered = render(&report, &source_name, generated_at);
    let out_path = resolve_out_path(args.out.as_deref(), &source_name, generated_at);
    if let Some(parent) = out_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(&out_path, &rendered)
        .with_context(|| format!("failed writing report {}", out_path.display()))?;

    println!(
        "Fail: {}  Warning: {}  Info: {}",
        report.summary.fail, report.summary.warning, report.summary.info
    );
    for section in &report.sections {
        let status = if let Some(error) = &section.error {
            format!("エラー: {error}")
        } else if !section.has_target {
            "該当なし".to_string()
        } else if section.issues.is_empty() {
            "問題なし".to_string()
        } else {
            format!("{}件の指摘", section.issues.len())
        };
        println!("  {} — {}", section.title, status);
    }
    if !report.visual_checks.is_empty() {
        println!("目視確認: {}件", report.visual_checks.len());
    }
    println!("report: {}", out_path.display());
    Ok(0)
}

fn print_categories() {
    for category in Category::ALL {
        let references: Vec<&str> = category
            .references()
            .iter()
            .map(|reference| reference.file_name)
            .collect();
        let suffix = if references.is_empty() {
            "（参照画像なし）".to_string()
        } else {
            format!("参照: {}", references.join(", "))
        };
        println!("{:8} {} {}", category.id(), category.display_name(), suffix);
    }
}

/// Parses the `--categories` list, deduplicating while keeping the enabled
/// subset; unknown ids are rejected by name.
fn parse_categories(raw: &str) -> Result<Vec<Category>> {
    let mut enabled = Vec::new();
    for token in raw.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let Some(category) = Category::parse(token) else {
            bail!("unknown category id: {token}");
        };
        if !enabled.contains(&category) {
            enabled.push(category);
        }
    }
    if enabled.is_empty() {
        bail!("no categories enabled");
    }
    Ok(enabled)
}

fn resolve_out_path(out: Option<&Path>, source_name: &str, at: DateTime<Utc>) -> PathBuf {
    match out {
        Some(path) if path.is_dir() => path.join(report_filename(source_name, at)),
        Some(path) => path.to_path_buf(),
        None => PathBuf::from(report_filename(source_name, at)),
    }
}
