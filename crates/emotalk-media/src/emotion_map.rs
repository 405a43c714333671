//! Emotion + intensity -> synthesis voice controls.
//!
//! Pure lookups and arithmetic. Nothing here does I/O or keeps state.

use emotalk_core::types::{Emotion, VoiceParameters, clamp_unit};

/// Fixed per-emotion base values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmotionBase {
    pub stability: f64,
    pub style: f64,
    pub speed: f64,
    /// Audio tag understood by tag-aware synthesis models. Empty for none.
    pub tag: &'static str,
}

pub const SPEED_MIN: f64 = 0.7;
pub const SPEED_MAX: f64 = 1.2;

pub fn base_for(emotion: Emotion) -> EmotionBase {
    let (stability, style, speed, tag) = match emotion {
        Emotion::Neutral => (0.5, 0.0, 0.9, ""),
        Emotion::Happy => (0.4, 0.6, 0.95, "[cheerfully]"),
        Emotion::Sad => (0.3, 0.5, 0.78, "[sorrowful]"),
        Emotion::Angry => (0.35, 0.7, 0.95, "[frustrated]"),
        Emotion::Surprised => (0.3, 0.6, 0.95, "[gasps]"),
        Emotion::Thinking => (0.6, 0.2, 0.82, "[pauses]"),
        Emotion::Anxious => (0.3, 0.5, 0.92, "[nervously]"),
        Emotion::Empathetic => (0.4, 0.4, 0.85, "[calm]"),
    };
    EmotionBase {
        stability,
        style,
        speed,
        tag,
    }
}

/// Delivery hint phrases and the tag each maps to. Matching is exact after
/// trimming (case-insensitive for the English entries).
const DELIVERY_TAGS: &[(&str, &str)] = &[
    ("조용히", "[quietly]"),
    ("울먹이며", "[tearfully]"),
    ("밝게", "[cheerfully]"),
    ("차분하게", "[calm]"),
    ("힘차게", "[energetically]"),
    ("부드럽게", "[softly]"),
    ("따뜻하게", "[warmly]"),
    ("단호하게", "[firmly]"),
    ("긴장하며", "[nervously]"),
    ("놀라며", "[gasps]"),
    ("생각하며", "[thoughtfully]"),
    ("걱정하며", "[worriedly]"),
    ("슬프게", "[sorrowful]"),
    ("화나며", "[frustrated]"),
    ("기쁘게", "[cheerfully]"),
    ("설레며", "[excited]"),
    ("quietly", "[quietly]"),
    ("tearfully", "[tearfully]"),
    ("brightly", "[cheerfully]"),
    ("cheerfully", "[cheerfully]"),
    ("calm", "[calm]"),
    ("calmly", "[calm]"),
    ("energetically", "[energetically]"),
    ("softly", "[softly]"),
    ("warmly", "[warmly]"),
    ("firmly", "[firmly]"),
    ("nervously", "[nervously]"),
    ("surprised", "[gasps]"),
    ("thoughtfully", "[thoughtfully]"),
    ("worriedly", "[worriedly]"),
    ("sadly", "[sorrowful]"),
    ("angrily", "[frustrated]"),
    ("happily", "[cheerfully]"),
    ("excitedly", "[excited]"),
];

/// Look up the tag for a delivery hint. Unknown or blank hints yield `None`.
pub fn delivery_tag_for(hint: &str) -> Option<&'static str> {
    let hint = hint.trim();
    if hint.is_empty() {
        return None;
    }
    DELIVERY_TAGS
        .iter()
        .find(|(phrase, _)| phrase.eq_ignore_ascii_case(hint))
        .map(|(_, tag)| *tag)
}

/// Snap a raw stability value onto the three values the engine accepts.
pub fn quantize_stability(raw: f64) -> f64 {
    if raw < 0.25 {
        0.0
    } else if raw < 0.75 {
        0.5
    } else {
        1.0
    }
}

/// Round to two decimals by the exact decimal value of `value`. Scaling by
/// 100 first would push values like 0.975 (stored just below) up to 0.98.
fn round2(value: f64) -> f64 {
    format!("{value:.2}").parse().unwrap_or(value)
}

/// Derive voice controls from an emotion and intensity. The emotion's own
/// tag (if any) becomes the delivery tag.
pub fn map(emotion: Emotion, intensity: f64) -> VoiceParameters {
    map_with_hint(emotion, intensity, None)
}

/// Like [`map`], additionally folding a delivery hint into the tag string.
///
/// Tags are deduplicated with the emotion tag first.
pub fn map_with_hint(emotion: Emotion, intensity: f64, hint: Option<&str>) -> VoiceParameters {
    let base = base_for(emotion);
    let i = clamp_unit(intensity);

    let stability = quantize_stability(base.stability - 0.2 * i);
    let style = (base.style + 0.2 * i).min(1.0);
    let speed = round2(1.0 + (base.speed - 1.0) * (0.5 + 0.5 * i)).clamp(SPEED_MIN, SPEED_MAX);

    let mut tags: Vec<&str> = Vec::with_capacity(2);
    if !base.tag.is_empty() {
        tags.push(base.tag);
    }
    if let Some(tag) = hint.and_then(delivery_tag_for) {
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    }

    VoiceParameters {
        stability,
        style,
        speed,
        delivery_tag: (!tags.is_empty()).then(|| tags.join(" ")),
    }
}

/// Prefix `text` with the parameters' delivery tags, if any.
pub fn tagged_text(text: &str, params: &VoiceParameters) -> String {
    match params.delivery_tag.as_deref() {
        Some(tag) if !tag.is_empty() => format!("{tag} {text}"),
        _ => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_bounds_hold_for_all_emotions() {
        for emotion in Emotion::ALL {
            for step in 0..=20 {
                let i = step as f64 / 20.0;
                let p = map(emotion, i);
                assert!(
                    [0.0, 0.5, 1.0].contains(&p.stability),
                    "{emotion} at {i}: stability {}",
                    p.stability
                );
                assert!((0.0..=1.0).contains(&p.style), "{emotion} at {i}: style {}", p.style);
                assert!(
                    (SPEED_MIN..=SPEED_MAX).contains(&p.speed),
                    "{emotion} at {i}: speed {}",
                    p.speed
                );
            }
        }
    }

    #[test]
    fn test_map_is_deterministic() {
        for emotion in Emotion::ALL {
            assert_eq!(map(emotion, 0.0), map(emotion, 0.0));
            assert_eq!(map(emotion, 1.0), map(emotion, 1.0));
        }
    }

    #[test]
    fn test_empathetic_worked_example() {
        let p = map(Emotion::Empathetic, 0.7);
        assert_eq!(p.stability, 0.5);
        assert!(approx(p.style, 0.54), "style {}", p.style);
        assert!(approx(p.speed, 0.87), "speed {}", p.speed);
        assert_eq!(p.delivery_tag.as_deref(), Some("[calm]"));
    }

    #[test]
    fn test_neutral_has_no_tag() {
        let p = map(Emotion::Neutral, 0.0);
        assert_eq!(p.stability, 0.5);
        assert!(approx(p.style, 0.0));
        assert!(approx(p.speed, 0.95));
        assert!(p.delivery_tag.is_none());
    }

    #[test]
    fn test_speed_rounds_by_decimal_value() {
        // Each of these lands just below a .xx5 boundary in binary.
        assert_eq!(map(Emotion::Happy, 0.0).speed, 0.97);
        assert_eq!(map(Emotion::Happy, 0.4).speed, 0.96);
        assert_eq!(map(Emotion::Sad, 0.5).speed, 0.83);
        assert_eq!(map(Emotion::Angry, 0.0).speed, 0.97);
        assert_eq!(map(Emotion::Surprised, 0.0).speed, 0.97);
    }

    #[test]
    fn test_round2_plain_values() {
        assert_eq!(round2(0.375), 0.38);
        assert_eq!(round2(0.8725), 0.87);
        assert_eq!(round2(1.2), 1.2);
    }

    #[test]
    fn test_out_of_range_intensity_is_clamped() {
        assert_eq!(map(Emotion::Angry, 7.0), map(Emotion::Angry, 1.0));
        assert_eq!(map(Emotion::Angry, -2.0), map(Emotion::Angry, 0.0));
    }

    #[test]
    fn test_quantize_boundaries() {
        assert_eq!(quantize_stability(0.2499), 0.0);
        assert_eq!(quantize_stability(0.25), 0.5);
        assert_eq!(quantize_stability(0.7499), 0.5);
        assert_eq!(quantize_stability(0.75), 1.0);
        assert_eq!(quantize_stability(-0.1), 0.0);
    }

    #[test]
    fn test_delivery_hint_lookup() {
        assert_eq!(delivery_tag_for("부드럽게"), Some("[softly]"));
        assert_eq!(delivery_tag_for(" Softly "), Some("[softly]"));
        assert_eq!(delivery_tag_for("brightly"), Some("[cheerfully]"));
        assert_eq!(delivery_tag_for("with jazz hands"), None);
        assert_eq!(delivery_tag_for(""), None);
    }

    #[test]
    fn test_tags_deduplicated_in_order() {
        let p = map_with_hint(Emotion::Happy, 0.6, Some("brightly"));
        assert_eq!(p.delivery_tag.as_deref(), Some("[cheerfully]"));

        let p = map_with_hint(Emotion::Empathetic, 0.6, Some("softly"));
        assert_eq!(p.delivery_tag.as_deref(), Some("[calm] [softly]"));

        let p = map_with_hint(Emotion::Neutral, 0.6, Some("softly"));
        assert_eq!(p.delivery_tag.as_deref(), Some("[softly]"));

        let p = map_with_hint(Emotion::Sad, 0.6, Some("unknown"));
        assert_eq!(p.delivery_tag.as_deref(), Some("[sorrowful]"));
    }

    #[test]
    fn test_tagged_text() {
        let p = map_with_hint(Emotion::Empathetic, 0.6, Some("softly"));
        assert_eq!(tagged_text("hello", &p), "[calm] [softly] hello");
        assert_eq!(tagged_text("hello", &map(Emotion::Neutral, 0.2)), "hello");
    }
}
