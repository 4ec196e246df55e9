use crate::error::PipelineError;
use crate::types::{AudioFile, CanonicalWaveform, SampleI16};
use crate::wav_writer::WavWriter;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::io::Cursor;
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tokio_util::sync::CancellationToken;

/// 正規化済み波形のファイル名
pub const CANONICAL_FILE_NAME: &str = "canonical.wav";

const RESAMPLE_CHUNK_SIZE: usize = 1024;

/// 任意のコンテナ・コーデックの音声をモノラル・固定サンプルレートのWAVに変換
///
/// `scratch_dir` に `canonical.wav` を1つだけ作成する。削除は呼び出し側の責任。
/// 失敗時は途中まで書いたファイルを削除してから返る。
/// ブロッキングスレッドで動かす前提で、`cancel` はパケット毎に確認する。
///
/// # Errors
///
/// - 入力が0バイト: [`PipelineError::EmptyInput`]（デコードは試みない）
/// - コンテナを解析できない・音声トラックがない: [`PipelineError::Decode`]
/// - デコード中に `cancel` が発火: [`PipelineError::Cancelled`]
pub fn normalize(
    file: &AudioFile,
    scratch_dir: &Path,
    target_rate: u32,
    cancel: &CancellationToken,
) -> Result<CanonicalWaveform, PipelineError> {
    if file.bytes.is_empty() {
        return Err(PipelineError::EmptyInput);
    }

    let result = decode_into_wav(file, scratch_dir, target_rate, cancel);
    if result.is_err() {
        let partial = scratch_dir.join(CANONICAL_FILE_NAME);
        if partial.exists() {
            if let Err(e) = std::fs::remove_file(&partial) {
                log::warn!("途中まで書いた波形の削除に失敗: {:?}: {}", partial, e);
            }
        }
    }
    result
}

fn decode_into_wav(
    file: &AudioFile,
    scratch_dir: &Path,
    target_rate: u32,
    cancel: &CancellationToken,
) -> Result<CanonicalWaveform, PipelineError> {
    let cursor = Cursor::new(file.bytes.clone());
    let mss = MediaSourceStream::new(Box::new(cursor), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = file.extension() {
        hint.with_extension(&ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| PipelineError::Decode(format!("コンテナ解析: {}", e)))?;

    let mut format = probed.format;

    // 映像付きコンテナでも最初の音声トラックを使う
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL && t.codec_params.sample_rate.is_some())
        .ok_or_else(|| PipelineError::Decode("音声トラックがありません".to_string()))?;

    let track_id = track.id;
    let codec_params = track.codec_params.clone();
    let source_rate = codec_params
        .sample_rate
        .ok_or_else(|| PipelineError::Decode("サンプルレート不明".to_string()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| PipelineError::Decode(format!("コーデック: {}", e)))?;

    let writer = WavWriter::create(scratch_dir, CANONICAL_FILE_NAME, target_rate)
        .map_err(|e| PipelineError::Artifact(std::io::Error::other(e.to_string())))?;
    let mut sink = MonoSink::new(writer, source_rate, target_rate)?;

    loop {
        if cancel.is_cancelled() {
            log::info!("正規化を中断しました: {}", file.filename);
            return Err(PipelineError::Cancelled);
        }

        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => {
                return Err(PipelineError::Decode(format!("パケット: {}", e)));
            }
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(e)) => {
                log::warn!("破損フレームをスキップ: {}", e);
                continue;
            }
            Err(e) => {
                return Err(PipelineError::Decode(format!("デコード: {}", e)));
            }
        };

        let spec = *decoded.spec();
        let num_frames = decoded.frames();
        if num_frames == 0 {
            continue;
        }
        let channels = spec.channels.count().max(1);

        let mut sample_buf = SampleBuffer::<f32>::new(num_frames as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);

        let mono = downmix(sample_buf.samples(), channels);
        sink.push(&mono)?;
    }

    let sample_count = sink.finish()?;
    if sample_count == 0 {
        return Err(PipelineError::Decode("音声サンプルがありません".to_string()));
    }

    let waveform = CanonicalWaveform {
        path: scratch_dir.join(CANONICAL_FILE_NAME),
        sample_rate: target_rate,
        sample_count,
    };

    log::info!(
        "正規化完了: {} ({} バイト, {} Hz → {} Hz, {:.1}秒)",
        file.filename,
        file.bytes.len(),
        source_rate,
        target_rate,
        waveform.duration_secs()
    );

    Ok(waveform)
}

/// インターリーブされたサンプルをチャンネル平均でモノラル化
fn downmix(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

fn to_i16(sample: f32) -> SampleI16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as SampleI16
}

/// モノラルサンプルを受け取り、必要ならリサンプリングしてWAVに書き込む
///
/// デコード結果全体をメモリに載せないよう、パケット単位で処理する。
struct MonoSink {
    writer: WavWriter,
    resampler: Option<SincFixedIn<f32>>,
    pending: Vec<f32>,
    ratio: f64,
    input_count: u64,
    /// 出力先頭から捨てるべき遅延サンプル数
    delay_remaining: usize,
}

impl MonoSink {
    fn new(writer: WavWriter, source_rate: u32, target_rate: u32) -> Result<Self, PipelineError> {
        let ratio = target_rate as f64 / source_rate as f64;
        let resampler = if source_rate == target_rate {
            None
        } else {
            let params = SincInterpolationParameters {
                sinc_len: 256,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 256,
                window: WindowFunction::BlackmanHarris2,
            };
            Some(
                SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLE_CHUNK_SIZE, 1)
                    .map_err(|e| PipelineError::Decode(format!("リサンプラー初期化: {}", e)))?,
            )
        };
        let delay_remaining = resampler.as_ref().map_or(0, |r| r.output_delay());

        Ok(Self {
            writer,
            resampler,
            pending: Vec::with_capacity(RESAMPLE_CHUNK_SIZE),
            ratio,
            input_count: 0,
            delay_remaining,
        })
    }

    fn expected_output(&self) -> u64 {
        (self.input_count as f64 * self.ratio).round() as u64
    }

    fn push(&mut self, samples: &[f32]) -> Result<(), PipelineError> {
        self.input_count += samples.len() as u64;

        if self.resampler.is_none() {
            let batch: Vec<SampleI16> = samples.iter().map(|&s| to_i16(s)).collect();
            return self.write(&batch);
        }

        for &s in samples {
            self.pending.push(s);
            if self.pending.len() == RESAMPLE_CHUNK_SIZE {
                let block = std::mem::take(&mut self.pending);
                self.resample_block(block, None)?;
            }
        }
        Ok(())
    }

    /// 残りを吐き出してファイルを確定し、書き込んだサンプル数を返す
    fn finish(mut self) -> Result<u64, PipelineError> {
        if self.resampler.is_some() {
            let limit = self.expected_output();
            if !self.pending.is_empty() {
                let mut block = std::mem::take(&mut self.pending);
                block.resize(RESAMPLE_CHUNK_SIZE, 0.0);
                self.resample_block(block, Some(limit))?;
            }
            // フィルタ遅延分を押し出す
            while self.writer.samples_written() < limit {
                let before = (self.writer.samples_written(), self.delay_remaining);
                self.resample_block(vec![0.0; RESAMPLE_CHUNK_SIZE], Some(limit))?;
                if (self.writer.samples_written(), self.delay_remaining) == before {
                    break;
                }
            }
        }

        let written = self.writer.samples_written();
        self.writer
            .finalize()
            .map_err(|e| PipelineError::Artifact(std::io::Error::other(e.to_string())))?;
        Ok(written)
    }

    fn resample_block(&mut self, block: Vec<f32>, limit: Option<u64>) -> Result<(), PipelineError> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(());
        };
        let output = resampler
            .process(&[block], None)
            .map_err(|e| PipelineError::Decode(format!("リサンプリング: {}", e)))?;

        if let Some(channel) = output.into_iter().next() {
            let skip = self.delay_remaining.min(channel.len());
            self.delay_remaining -= skip;
            let mut batch: Vec<SampleI16> = channel[skip..].iter().map(|&s| to_i16(s)).collect();
            if let Some(limit) = limit {
                let room = limit.saturating_sub(self.writer.samples_written());
                batch.truncate(usize::try_from(room).unwrap_or(usize::MAX));
            }
            self.write(&batch)?;
        }
        Ok(())
    }

    fn write(&mut self, samples: &[SampleI16]) -> Result<(), PipelineError> {
        self.writer
            .write_samples(samples)
            .map_err(|e| PipelineError::Artifact(std::io::Error::other(e.to_string())))
    }
}
