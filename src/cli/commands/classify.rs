//! `sfetch classify` command.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use console::style;

use stealthfetch::pipeline::ResponseClassifier;
use stealthfetch::{Expect, Settings};

/// Run the configured classifier against a saved body.
pub fn cmd_classify(
    settings: &Settings,
    file: &Path,
    status: u16,
    content_type: Option<&str>,
    expect: Expect,
) -> anyhow::Result<()> {
    let body = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;

    let mut headers = HashMap::new();
    if let Some(ct) = content_type {
        headers.insert("content-type".to_string(), ct.to_string());
    }

    let classifier = ResponseClassifier::new(&settings.classifier_config());
    let outcome = classifier.classify(status, &headers, &body, body.len() as u64, expect);

    let marker = if outcome.is_success() {
        style("✓").green()
    } else {
        style("✗").red()
    };
    eprintln!("{} {} ({} bytes): {}", marker, file.display(), body.len(), outcome);
    println!("{}", serde_json::to_string(&outcome)?);
    Ok(())
}
