//! `sfetch fetch` command.

use std::path::{Path, PathBuf};

use anyhow::Context;
use console::style;
use futures::future::join_all;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;

use stealthfetch::{CancelHandle, FetchOptions, Fetcher, Payload, Settings, TerminalFailure};

pub async fn cmd_fetch(
    settings: &Settings,
    urls: &[String],
    options: &FetchOptions,
    out: Option<&Path>,
    show_stats: bool,
) -> anyhow::Result<()> {
    let fetcher = Fetcher::from_settings(settings).context("Failed to set up fetcher")?;

    if let Some(dir) = out {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let cancel = CancelHandle::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{} Cancelling; waiting for in-flight requests", style("!").yellow());
                cancel.cancel();
            }
        }
    });

    let pb = ProgressBar::new(urls.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} {wide_msg}")?
            .progress_chars("=> "),
    );

    let results = join_all(urls.iter().map(|url| {
        let fetcher = fetcher.clone();
        let token = cancel.token();
        let pb = pb.clone();
        async move {
            let result = fetcher.fetch_cancellable(url, options, token).await;
            pb.set_message(url.clone());
            pb.inc(1);
            result
        }
    }))
    .await;
    pb.finish_and_clear();

    let mut failed = 0usize;
    for (index, result) in results.into_iter().enumerate() {
        let line = match result {
            Ok(payload) => {
                let saved = match out {
                    Some(dir) => Some(save_body(dir, index, &payload).await?),
                    None => None,
                };
                success_line(&payload, saved.as_deref())
            }
            Err(failure) => {
                failed += 1;
                failure_line(&failure)?
            }
        };
        println!("{}", line);
    }

    if show_stats {
        for stat in fetcher.route_stats() {
            eprintln!(
                "  {} {} {}: {} dispatch(es)",
                style("→").dim(),
                stat.id,
                stat.address,
                stat.dispatches
            );
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} URL(s) failed", failed, urls.len());
    }
    Ok(())
}

fn success_line(payload: &Payload, saved: Option<&Path>) -> serde_json::Value {
    json!({
        "ok": true,
        "url": payload.url,
        "status": payload.status,
        "bytes": payload.body.len(),
        "content_type": payload.content_type(),
        "attempts": payload.attempts,
        "route": payload.route_id,
        "saved_to": saved.map(|p| p.display().to_string()),
    })
}

fn failure_line(failure: &TerminalFailure) -> anyhow::Result<serde_json::Value> {
    let mut value = serde_json::to_value(failure)?;
    if let Some(map) = value.as_object_mut() {
        map.insert("ok".to_string(), json!(false));
    }
    Ok(value)
}

async fn save_body(dir: &Path, index: usize, payload: &Payload) -> anyhow::Result<PathBuf> {
    let path = dir.join(file_name_for(index, &payload.url));
    tokio::fs::write(&path, &payload.body)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

/// `003-example.com_products_1` style names: input position plus a slug of the URL.
fn file_name_for(index: usize, url: &str) -> String {
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    let slug: String = without_scheme
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    let slug = slug.trim_matches('_');
    let slug: String = slug.chars().take(100).collect();
    format!("{:03}-{}", index, if slug.is_empty() { "index" } else { slug.as_str() })
}
