use crate::config::SegmenterConfig;
use crate::error::PipelineError;
use crate::types::{CanonicalWaveform, Chunk};
use crate::wav_writer::WavWriter;
use std::fs;
use std::path::{Path, PathBuf};

/// チャンク計画の1区間（サンプル単位）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkSpan {
    pub start_sample: u64,
    pub sample_count: u64,
}

/// 総サンプル数を `chunk_samples` 毎の連続・非重複区間に分ける
///
/// 区間数は `ceil(total / chunk_samples)`、最後の区間だけが短くなりうる。
pub fn plan_chunks(total_samples: u64, chunk_samples: u64) -> Vec<ChunkSpan> {
    if total_samples == 0 || chunk_samples == 0 {
        return Vec::new();
    }
    let count = total_samples.div_ceil(chunk_samples);
    (0..count)
        .map(|i| {
            let start_sample = i * chunk_samples;
            ChunkSpan {
                start_sample,
                sample_count: chunk_samples.min(total_samples - start_sample),
            }
        })
        .collect()
}

/// 正規化済み波形をチャンクに分割する
///
/// 録音が `split_threshold_secs` 以下なら分割せず、波形ファイルそのものを
/// 唯一のチャンクとして引き渡す。超える場合はサンプルをストリーミングで
/// 読み出して `chunk_{index}.wav` を書き、元の波形ファイルは削除する。
#[derive(Clone, Debug)]
pub struct Segmenter {
    chunk_length_secs: u64,
    split_threshold_secs: u64,
}

impl Segmenter {
    pub fn new(config: &SegmenterConfig) -> Self {
        Self {
            chunk_length_secs: config.chunk_length_secs.max(1),
            split_threshold_secs: config.split_threshold_secs,
        }
    }

    /// 波形の所有権を受け取り、チャンク列を返す
    pub fn segment(
        &self,
        waveform: CanonicalWaveform,
        scratch_dir: &Path,
    ) -> Result<Vec<Chunk>, PipelineError> {
        let duration = waveform.duration_secs();

        if duration <= self.split_threshold_secs as f64 {
            log::info!("分割不要: {:.1}秒 (閾値 {}秒)", duration, self.split_threshold_secs);
            return Ok(vec![Chunk {
                index: 0,
                start_offset_secs: 0.0,
                duration_secs: duration,
                sample_count: waveform.sample_count,
                path: waveform.path,
            }]);
        }

        let mut written: Vec<PathBuf> = Vec::new();
        let result = self.split(&waveform, scratch_dir, &mut written);

        if let Err(e) = fs::remove_file(&waveform.path) {
            log::warn!("波形ファイルの削除に失敗: {:?}: {}", waveform.path, e);
        }

        match result {
            Ok(chunks) => {
                log::info!(
                    "音声を {} チャンクに分割 (各 ~{}秒, 合計 {:.1}秒)",
                    chunks.len(),
                    self.chunk_length_secs,
                    duration
                );
                Ok(chunks)
            }
            Err(e) => {
                for path in written {
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => log::warn!("チャンクファイルの削除に失敗: {:?}: {}", path, e),
                    }
                }
                Err(e)
            }
        }
    }

    fn split(
        &self,
        waveform: &CanonicalWaveform,
        scratch_dir: &Path,
        written: &mut Vec<PathBuf>,
    ) -> Result<Vec<Chunk>, PipelineError> {
        let mut reader = hound::WavReader::open(&waveform.path)
            .map_err(|e| PipelineError::Artifact(std::io::Error::other(e.to_string())))?;
        let sample_rate = reader.spec().sample_rate;
        let total = reader.duration() as u64;
        let chunk_samples = self.chunk_length_secs * sample_rate as u64;

        let mut samples = reader.samples::<i16>();
        let mut chunks = Vec::new();

        for (index, span) in plan_chunks(total, chunk_samples).into_iter().enumerate() {
            let file_name = format!("chunk_{}.wav", index);
            let mut writer = WavWriter::create(scratch_dir, &file_name, sample_rate)
                .map_err(|e| PipelineError::Artifact(std::io::Error::other(e.to_string())))?;
            written.push(writer.path().to_path_buf());

            for _ in 0..span.sample_count {
                let sample = match samples.next() {
                    Some(Ok(s)) => s,
                    Some(Err(e)) => {
                        return Err(PipelineError::Artifact(std::io::Error::other(e.to_string())))
                    }
                    None => break,
                };
                writer
                    .write_sample(sample)
                    .map_err(|e| PipelineError::Artifact(std::io::Error::other(e.to_string())))?;
            }

            let sample_count = writer.samples_written();
            let path = writer
                .finalize()
                .map_err(|e| PipelineError::Artifact(std::io::Error::other(e.to_string())))?;

            chunks.push(Chunk {
                index,
                start_offset_secs: span.start_sample as f64 / sample_rate as f64,
                duration_secs: sample_count as f64 / sample_rate as f64,
                sample_count,
                path,
            });
        }

        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_waveform(dir: &Path, sample_rate: u32, samples: u64) -> CanonicalWaveform {
        let mut writer = WavWriter::create(dir, "canonical.wav", sample_rate).unwrap();
        for i in 0..samples {
            writer.write_sample((i % 1000) as i16).unwrap();
        }
        let path = writer.finalize().unwrap();
        CanonicalWaveform {
            path,
            sample_rate,
            sample_count: samples,
        }
    }

    fn segmenter(chunk: u64, threshold: u64) -> Segmenter {
        Segmenter::new(&SegmenterConfig {
            chunk_length_secs: chunk,
            split_threshold_secs: threshold,
        })
    }

    #[test]
    fn test_plan_chunks_count_and_coverage() {
        for (total, size) in [(10u64, 3u64), (9, 3), (1, 5), (16000 * 301, 16000 * 300)] {
            let plan = plan_chunks(total, size);
            assert_eq!(plan.len() as u64, total.div_ceil(size));
            assert_eq!(plan.iter().map(|s| s.sample_count).sum::<u64>(), total);
            for pair in plan.windows(2) {
                assert_eq!(pair[0].start_sample + pair[0].sample_count, pair[1].start_sample);
            }
            assert!(plan.iter().all(|s| s.sample_count > 0));
        }
    }

    #[test]
    fn test_plan_chunks_empty() {
        assert!(plan_chunks(0, 100).is_empty());
        assert!(plan_chunks(100, 0).is_empty());
    }

    #[test]
    fn test_short_recording_not_split() {
        let dir = TempDir::new().unwrap();
        let waveform = write_waveform(dir.path(), 100, 250);
        let original_path = waveform.path.clone();

        let chunks = segmenter(3, 3).segment(waveform, dir.path()).unwrap();

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].path, original_path);
        assert_eq!(chunks[0].sample_count, 250);
        assert!((chunks[0].duration_secs - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_long_recording_split_into_contiguous_chunks() {
        let dir = TempDir::new().unwrap();
        // 7.5秒 @ 100Hz、3秒チャンク → 3チャンク (3 + 3 + 1.5)
        let waveform = write_waveform(dir.path(), 100, 750);
        let canonical = waveform.path.clone();

        let chunks = segmenter(3, 3).segment(waveform, dir.path()).unwrap();

        assert_eq!(chunks.len(), 3);
        assert!(!canonical.exists());

        let total: f64 = chunks.iter().map(|c| c.duration_secs).sum();
        assert!((total - 7.5).abs() < 0.01);
        assert_eq!(chunks[0].start_offset_secs, 0.0);
        assert_eq!(chunks[1].start_offset_secs, 3.0);
        assert_eq!(chunks[2].start_offset_secs, 6.0);
        assert!((chunks[2].duration_secs - 1.5).abs() < 1e-9);

        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
            let reader = hound::WavReader::open(&chunk.path).unwrap();
            assert_eq!(reader.duration() as u64, chunk.sample_count);
        }
    }

    #[test]
    fn test_truncated_waveform_removes_partial_chunks() {
        let dir = TempDir::new().unwrap();
        // ヘッダ上は 750 サンプルだが、実データは 500 サンプルで途切れる
        let waveform = write_waveform(dir.path(), 100, 750);
        let file = fs::OpenOptions::new()
            .write(true)
            .open(&waveform.path)
            .unwrap();
        file.set_len(44 + 500 * 2).unwrap();
        drop(file);

        let result = segmenter(3, 3).segment(waveform, dir.path());

        assert!(matches!(result, Err(PipelineError::Artifact(_))));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_chunk_content_is_contiguous() {
        let dir = TempDir::new().unwrap();
        let waveform = write_waveform(dir.path(), 10, 45);

        let chunks = segmenter(2, 2).segment(waveform, dir.path()).unwrap();

        let mut all = Vec::new();
        for chunk in &chunks {
            let mut reader = hound::WavReader::open(&chunk.path).unwrap();
            all.extend(reader.samples::<i16>().map(|s| s.unwrap()));
        }
        let expected: Vec<i16> = (0..45).map(|i| (i % 1000) as i16).collect();
        assert_eq!(all, expected);
    }
}
