use crate::types::SampleI16;
use anyhow::{Context, Result};
use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

/// モノラル16ビットWAVファイルの書き出し
///
/// 正規化済み波形とチャンクファイルの両方で使う。
/// `finalize` を呼ばずにドロップされた場合もヘッダを確定させる。
pub struct WavWriter {
    path: PathBuf,
    current_file: Option<hound::WavWriter<BufWriter<fs::File>>>,
    spec: hound::WavSpec,
    samples_written: u64,
}

impl WavWriter {
    /// `dir` 配下に `file_name` でWAVファイルを作成
    pub fn create<P: AsRef<Path>>(dir: P, file_name: &str, sample_rate: u32) -> Result<Self> {
        let dir = dir.as_ref();

        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("出力ディレクトリの作成に失敗: {:?}", dir))?;
        }

        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let path = dir.join(file_name);
        let writer = hound::WavWriter::create(&path, spec)
            .with_context(|| format!("WAVファイルの作成に失敗: {:?}", path))?;

        log::debug!("WAVファイル作成: {:?}", path);

        Ok(Self {
            path,
            current_file: Some(writer),
            spec,
            samples_written: 0,
        })
    }

    /// サンプルを書き込み
    pub fn write_samples(&mut self, samples: &[SampleI16]) -> Result<()> {
        if let Some(writer) = &mut self.current_file {
            for &sample in samples {
                writer
                    .write_sample(sample)
                    .with_context(|| "WAVファイルへのサンプル書き込みに失敗")?;
            }
            self.samples_written += samples.len() as u64;
        }
        Ok(())
    }

    /// 1サンプルを書き込み
    pub fn write_sample(&mut self, sample: SampleI16) -> Result<()> {
        if let Some(writer) = &mut self.current_file {
            writer
                .write_sample(sample)
                .with_context(|| "WAVファイルへのサンプル書き込みに失敗")?;
            self.samples_written += 1;
        }
        Ok(())
    }

    /// ファイルを確定し、パスを返す
    pub fn finalize(&mut self) -> Result<PathBuf> {
        if let Some(writer) = self.current_file.take() {
            writer
                .finalize()
                .with_context(|| "WAVファイルのファイナライズに失敗")?;
            log::debug!(
                "WAVファイル書き込み完了: {:?}, {}サンプル ({:.2}秒)",
                self.path,
                self.samples_written,
                self.duration_seconds()
            );
        }
        Ok(self.path.clone())
    }

    /// 書き込んだサンプル数
    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }

    /// 書き込んだ時間（秒）
    pub fn duration_seconds(&self) -> f64 {
        self.samples_written as f64 / self.spec.sample_rate as f64
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WavWriter {
    fn drop(&mut self) {
        if self.current_file.is_some() {
            if let Err(e) = self.finalize() {
                log::error!("WavWriter のドロップ時にエラー: {}", e);
            }
        }
    }
}
