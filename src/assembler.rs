use crate::types::{SegmentResult, SegmentStatus};

/// 秒数を `mm:ss` 形式に変換（1時間を超えても分で数える）
pub fn format_timestamp(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds.floor() as u64
    } else {
        0
    };
    format!("{:02}:{:02}", total / 60, total % 60)
}

/// 失敗セグメントのプレースホルダ（チャンク番号は1始まり）
pub fn placeholder(result: &SegmentResult) -> String {
    format!("[segment {}: {}]", result.chunk_index + 1, result.status.label())
}

/// チャンク結果を1本のトランスクリプトに連結する
///
/// 入力の並びに関わらずチャンク番号順に並べ直す。`Ok` 以外のチャンクは
/// 黙って捨てず、番号付きのプレースホルダを挿入する。
/// `timestamps` が真なら各セグメントの先頭に `[mm:ss]` を付ける。
/// 空の入力からは空文字列を返す。
pub fn assemble(results: &[SegmentResult], timestamps: bool) -> String {
    let mut ordered: Vec<&SegmentResult> = results.iter().collect();
    ordered.sort_by_key(|r| r.chunk_index);

    ordered
        .into_iter()
        .map(|result| {
            let body = match result.status {
                SegmentStatus::Ok => result.text.trim().to_string(),
                _ => placeholder(result),
            };
            if timestamps {
                format!("[{}] {}", format_timestamp(result.start_offset_secs), body)
            } else {
                body
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(index: usize, status: SegmentStatus, text: &str) -> SegmentResult {
        SegmentResult {
            chunk_index: index,
            start_offset_secs: index as f64 * 300.0,
            status,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_empty_input_yields_empty_string() {
        assert_eq!(assemble(&[], false), "");
        assert_eq!(assemble(&[], true), "");
    }

    #[test]
    fn test_failure_marker_between_successes() {
        let results = vec![
            result(0, SegmentStatus::Ok, "A"),
            result(
                1,
                SegmentStatus::EngineError {
                    diagnostic: "boom".into(),
                },
                "",
            ),
            result(2, SegmentStatus::Ok, "B"),
        ];
        let transcript = assemble(&results, false);
        assert_eq!(transcript, "A [segment 2: error: boom] B");
    }

    #[test]
    fn test_order_restored_regardless_of_arrival() {
        let results = vec![
            result(2, SegmentStatus::Ok, "three"),
            result(0, SegmentStatus::Ok, "one"),
            result(1, SegmentStatus::Timeout, ""),
        ];
        assert_eq!(
            assemble(&results, false),
            "one [segment 2: timeout] three"
        );
    }

    #[test]
    fn test_empty_segment_placeholder() {
        let results = vec![result(0, SegmentStatus::Empty, "")];
        assert_eq!(assemble(&results, false), "[segment 1: no speech]");
    }

    #[test]
    fn test_timestamps() {
        let results = vec![
            result(0, SegmentStatus::Ok, "hello"),
            result(1, SegmentStatus::Ok, "world"),
            result(13, SegmentStatus::Timeout, ""),
        ];
        assert_eq!(
            assemble(&results, true),
            "[00:00] hello [05:00] world [65:00] [segment 14: timeout]"
        );
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0.0), "00:00");
        assert_eq!(format_timestamp(59.9), "00:59");
        assert_eq!(format_timestamp(61.0), "01:01");
        assert_eq!(format_timestamp(3725.0), "62:05");
        assert_eq!(format_timestamp(-3.0), "00:00");
        assert_eq!(format_timestamp(f64::NAN), "00:00");
    }

    #[test]
    fn test_segment_count_preserved() {
        let results: Vec<SegmentResult> = (0..5)
            .map(|i| {
                if i % 2 == 0 {
                    result(i, SegmentStatus::Ok, "x")
                } else {
                    result(i, SegmentStatus::Empty, "")
                }
            })
            .collect();
        let transcript = assemble(&results, false);
        assert_eq!(transcript.matches("[segment").count(), 2);
        assert_eq!(transcript.matches('x').count(), 3);
    }
}
