use anyhow::{Context, Result};
use env_logger::Env;
use serde::Serialize;
use std::path::Path;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use voice_summary::capabilities::Capabilities;
use voice_summary::config::Config;
use voice_summary::error::PipelineError;
use voice_summary::pipeline::Pipeline;
use voice_summary::types::AudioFile;

const USAGE: &str = "使い方:
  voice-summary <音声ファイル> [config.toml]
  voice-summary --generate-config [config.toml]";

/// 失敗時に標準出力へ出すJSON
#[derive(Serialize)]
struct ErrorOutput {
    error: String,
    status: u16,
    client_error: bool,
}

impl From<&PipelineError> for ErrorOutput {
    fn from(e: &PipelineError) -> Self {
        Self {
            error: e.to_string(),
            status: e.status_code(),
            client_error: e.is_client_error(),
        }
    }
}

fn init_logger(default_level: &str) {
    env_logger::Builder::from_env(Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .filter_module("symphonia", log::LevelFilter::Warn)
        .filter_module("reqwest", log::LevelFilter::Warn)
        .filter_module("hyper", log::LevelFilter::Warn)
        .init();
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    let json = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{}", json);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("エラー: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode> {
    let args: Vec<String> = std::env::args().collect();

    // 設定ファイル生成モード
    if args.len() > 1 && args[1] == "--generate-config" {
        let config_path: &str = if args.len() > 2 {
            &args[2]
        } else {
            "config.toml"
        };
        Config::write_default(config_path)?;
        println!("設定ファイルを生成しました: {}", config_path);
        return Ok(ExitCode::SUCCESS);
    }

    if args.len() < 2 || args[1].starts_with("--") {
        eprintln!("{}", USAGE);
        return Ok(ExitCode::from(2));
    }

    let audio_path = Path::new(&args[1]);
    let config_path: &str = if args.len() > 2 {
        &args[2]
    } else {
        "config.toml"
    };

    // ログレベルが設定ファイルにあるので、ロガーより先に読む
    let config_exists = Path::new(config_path).exists();
    let config = if config_exists {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };

    init_logger(&config.output.log_level);

    if !config_exists {
        log::warn!(
            "設定ファイル {} が見つかりません。デフォルト設定を使用します",
            config_path
        );
    }

    log::info!("voice-summary を起動します");
    log::debug!("設定: {:?}", config.recognition);

    let bytes = tokio::fs::read(audio_path)
        .await
        .with_context(|| format!("音声ファイルの読み込みに失敗: {:?}", audio_path))?;
    let filename = audio_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let capabilities = Capabilities::from_config(&config)?;
    let pretty = config.output.pretty;
    let pipeline = Pipeline::new(config, capabilities.clone())?;

    // Ctrl+C ハンドラを設定
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    ctrlc::set_handler(move || {
        log::info!("停止シグナルを受信しました...");
        cancel_clone.cancel();
    })?;

    let result = pipeline
        .process(AudioFile::new(bytes, filename), &cancel)
        .await;

    capabilities.shutdown().await;

    match result {
        Ok(output) => {
            print_json(&output, pretty)?;
            log::info!("voice-summary を終了しました");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            print_json(&ErrorOutput::from(&e), pretty)?;
            if e.is_client_error() {
                Ok(ExitCode::from(2))
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
    }
}
