//! Caption layout: word timings to ASS subtitle lines.

use std::fmt::Write;

use crate::adapters::WordTiming;

/// Limits that force a new caption line
#[derive(Debug, Clone, Copy)]
pub struct CaptionLimits {
    /// Summed word durations in a line, seconds
    pub max_duration: f64,

    /// Characters in a line including single spaces
    pub max_chars: usize,

    /// Silence between consecutive words, seconds
    pub max_gap: f64,
}

impl Default for CaptionLimits {
    fn default() -> Self {
        Self {
            max_duration: 3.0,
            max_chars: 80,
            max_gap: 1.5,
        }
    }
}

/// One displayed caption line
#[derive(Debug, Clone, PartialEq)]
pub struct CaptionLine {
    pub words: Vec<WordTiming>,
}

impl CaptionLine {
    pub fn text(&self) -> String {
        self.words
            .iter()
            .map(|w| w.word.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn start(&self) -> f64 {
        self.words.first().map(|w| w.start).unwrap_or(0.0)
    }

    pub fn end(&self) -> f64 {
        self.words.last().map(|w| w.end).unwrap_or(0.0)
    }
}

/// Group words into lines.
///
/// A word is added to the current line first; if that pushes the line over
/// a limit, the line (including that word) is closed.
pub fn group_words(words: &[WordTiming], limits: &CaptionLimits) -> Vec<CaptionLine> {
    let mut lines = Vec::new();
    let mut current: Vec<WordTiming> = Vec::new();
    let mut duration = 0.0;
    let mut chars = 0;

    for (i, word) in words.iter().enumerate() {
        chars += word.word.chars().count() + usize::from(!current.is_empty());
        duration += word.end - word.start;
        current.push(word.clone());

        let gap_exceeded = i > 0 && word.start - words[i - 1].end > limits.max_gap;
        if duration > limits.max_duration || chars > limits.max_chars || gap_exceeded {
            lines.push(CaptionLine {
                words: std::mem::take(&mut current),
            });
            duration = 0.0;
            chars = 0;
        }
    }

    if !current.is_empty() {
        lines.push(CaptionLine { words: current });
    }
    lines
}

/// `H:MM:SS.cc`
fn ass_time(seconds: f64) -> String {
    let centis = (seconds.max(0.0) * 100.0).floor() as u64;
    let (hours, rest) = (centis / 360_000, centis % 360_000);
    let (minutes, rest) = (rest / 6_000, rest % 6_000);
    let (secs, cs) = (rest / 100, rest % 100);
    format!("{hours}:{minutes:02}:{secs:02}.{cs:02}")
}

const ASS_HEADER: &str = "[Script Info]
Title: Word-level subtitles
ScriptType: v4.00+
PlayResX: 1080
PlayResY: 1920
Timer: 100.0000

[V4+ Styles]
Format: Name, Fontname, Fontsize, PrimaryColour, SecondaryColour, OutlineColour, BackColour, Bold, Italic, Underline, StrikeOut, ScaleX, ScaleY, Spacing, Angle, BorderStyle, Outline, Shadow, Alignment, MarginL, MarginR, MarginV, Encoding
Style: Default,Arial,70,&H00FFFFFF,&H000000FF,&H00000000,&H00000000,-1,0,0,0,100,100,0,0,1,2,0,5,10,10,30,1
Style: Highlight,Arial,70,&H00FFFFFF,&H000000FF,&H00000000,&H000000FF,-1,0,0,0,100,100,0,0,1,2,0,5,10,10,30,1

[Events]
Format: Layer, Start, End, Style, Name, MarginL, MarginR, MarginV, Effect, Text
";

/// Render lines as an ASS script.
///
/// Each line is shown whole on layer 0; on layer 1 the currently spoken
/// word is drawn highlighted for its own time span.
pub fn render_ass(lines: &[CaptionLine]) -> String {
    let mut out = String::from(ASS_HEADER);

    for line in lines {
        let text = line.text();
        let _ = writeln!(
            out,
            "Dialogue: 0,{},{},Default,,0,0,0,,{}",
            ass_time(line.start()),
            ass_time(line.end()),
            text
        );

        for (i, word) in line.words.iter().enumerate() {
            let highlighted: Vec<String> = line
                .words
                .iter()
                .enumerate()
                .map(|(j, w)| {
                    if i == j {
                        format!("{{\\c&H00FFFF&}}{}{{\\c&HFFFFFF&}}", w.word)
                    } else {
                        w.word.clone()
                    }
                })
                .collect();
            let _ = writeln!(
                out,
                "Dialogue: 1,{},{},Highlight,,0,0,0,,{}",
                ass_time(word.start),
                ass_time(word.end),
                highlighted.join(" ")
            );
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w(word: &str, start: f64, end: f64) -> WordTiming {
        WordTiming {
            word: word.to_string(),
            start,
            end,
        }
    }

    #[test]
    fn test_long_silence_closes_line() {
        let words = vec![w("Cats", 0.0, 0.3), w("purr.", 0.4, 0.8), w("Dogs", 2.5, 2.8)];
        let lines = group_words(&words, &CaptionLimits::default());

        // The gap is detected on "Dogs", which closes the line it joined
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text(), "Cats purr. Dogs");

        let words = vec![
            w("Cats", 0.0, 0.3),
            w("purr.", 0.4, 0.8),
            w("Dogs", 2.5, 2.8),
            w("bark.", 2.9, 3.2),
        ];
        let lines = group_words(&words, &CaptionLimits::default());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].text(), "bark.");
    }

    #[test]
    fn test_duration_limit_splits_lines() {
        let words: Vec<WordTiming> = (0..8)
            .map(|i| w("word", i as f64, i as f64 + 0.9))
            .collect();
        let lines = group_words(&words, &CaptionLimits::default());

        // 0.9s per word: the fourth word pushes a line past 3.0s
        assert_eq!(lines[0].words.len(), 4);
        assert_eq!(lines[1].words.len(), 4);
    }

    #[test]
    fn test_char_limit_splits_lines() {
        let long = "a".repeat(50);
        let words = vec![w(&long, 0.0, 0.1), w(&long, 0.1, 0.2), w("end", 0.2, 0.3)];
        let lines = group_words(&words, &CaptionLimits::default());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].text(), "end");
    }

    #[test]
    fn test_ass_time_format() {
        assert_eq!(ass_time(0.0), "0:00:00.00");
        assert_eq!(ass_time(65.25), "0:01:05.25");
        assert_eq!(ass_time(3723.5), "1:02:03.50");
    }

    #[test]
    fn test_render_highlights_each_word_once() {
        let lines = group_words(&[w("Hi", 0.0, 0.5), w("there", 0.6, 1.0)], &CaptionLimits::default());
        let ass = render_ass(&lines);

        assert!(ass.starts_with("[Script Info]"));
        assert!(ass.contains("Dialogue: 0,0:00:00.00,0:00:01.00,Default,,0,0,0,,Hi there\n"));
        assert!(ass.contains("Highlight,,0,0,0,,{\\c&H00FFFF&}Hi{\\c&HFFFFFF&} there\n"));
        assert!(ass.contains("Highlight,,0,0,0,,Hi {\\c&H00FFFF&}there{\\c&HFFFFFF&}\n"));
        assert_eq!(ass.matches("Dialogue: 1,").count(), 2);
    }
}
