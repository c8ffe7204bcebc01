//! CLI `model download`: fetch the ONNX export and tokenizer for the local
//! embedding provider.

use anyhow::{Context, Result};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use tokio::io::AsyncWriteExt;

use crate::config::EmbeddingConfig;
use crate::embedding::local::model_files;

const HUB: &str = "https://huggingface.co/sentence-transformers";

fn model_url(model: &str) -> String {
    format!("{HUB}/{model}/resolve/main/onnx/model.onnx")
}

fn tokenizer_url(model: &str) -> String {
    format!("{HUB}/{model}/resolve/main/tokenizer.json")
}

/// Download whatever of the model and tokenizer is missing from the cache dir.
pub async fn download(config: &EmbeddingConfig) -> Result<()> {
    let (model_path, tokenizer_path) = model_files(config);
    if let Some(dir) = model_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create cache dir: {}", dir.display()))?;
    }

    for (what, url, path) in [
        ("model.onnx", model_url(&config.model), &model_path),
        ("tokenizer.json", tokenizer_url(&config.model), &tokenizer_path),
    ] {
        if path.exists() {
            println!("{what} already present at {}", path.display());
            continue;
        }
        println!("Downloading {what} for {}...", config.model);
        download_file(&url, path).await?;
        println!("Saved {}", path.display());
    }

    println!("Model ready. Set `embedding.provider = \"local\"` to use it (the default).");
    Ok(())
}

/// Stream `url` into `dest` via a temp file, so a broken download never
/// leaves a truncated model behind.
async fn download_file(url: &str, dest: &Path) -> Result<()> {
    let response = reqwest::get(url)
        .await
        .with_context(|| format!("HTTP request failed for {url}"))?;
    anyhow::ensure!(
        response.status().is_success(),
        "download of {url} failed with HTTP {}",
        response.status()
    );

    let pb = match response.content_length() {
        Some(size) => {
            let pb = ProgressBar::new(size);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("  {bar:40.cyan/blue} {bytes}/{total_bytes} ({eta})")
                    .context("invalid progress template")?
                    .progress_chars("##-"),
            );
            pb
        }
        None => ProgressBar::new_spinner(),
    };

    let tmp_path = dest.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("error reading response")?;
        file.write_all(&chunk).await.context("error writing to file")?;
        pb.inc(chunk.len() as u64);
    }
    file.flush().await?;
    drop(file);

    tokio::fs::rename(&tmp_path, dest)
        .await
        .context("failed to move download into place")?;
    pb.finish_and_clear();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_follow_the_configured_model() {
        assert_eq!(
            model_url("all-MiniLM-L6-v2"),
            "https://huggingface.co/sentence-transformers/all-MiniLM-L6-v2/resolve/main/onnx/model.onnx"
        );
        assert!(tokenizer_url("paraphrase-MiniLM-L3-v2").ends_with("paraphrase-MiniLM-L3-v2/resolve/main/tokenizer.json"));
    }

    #[tokio::test]
    async fn present_files_are_not_downloaded_again() {
        let dir = tempfile::tempdir().unwrap();
        let config = EmbeddingConfig {
            cache_dir: dir.path().to_string_lossy().into_owned(),
            ..EmbeddingConfig::default()
        };
        let (model, tokenizer) = model_files(&config);
        std::fs::write(&model, b"onnx").unwrap();
        std::fs::write(&tokenizer, b"{}").unwrap();

        download(&config).await.unwrap();
        assert_eq!(std::fs::read(&model).unwrap(), b"onnx");
    }
}
