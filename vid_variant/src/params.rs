//! Parameter randomizer: seeded per-run encoder, audio and filter values
//!
//! `derive(seed, bounds)` is a pure function: same seed and bounds, same
//! [`ParameterSet`]. Bounds are checked once by [`ParameterBounds::validate`];
//! the resulting [`ValidatedBounds`] is never re-checked when drawing.

use std::collections::BTreeMap;
use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::errors::ParamError;

/// Salt mixed into a plan seed to get the parameter seed.
pub const PARAMS_SALT: u64 = 0x7061_7261_6d73;

/// SplitMix64 finalizer over `seed ^ salt`.
///
/// Used to derive independent streams (attempt seeds, parameter seeds)
/// from one recorded seed.
pub fn mix_seed(seed: u64, salt: u64) -> u64 {
    let mut z = (seed ^ salt).wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

// ═══════════════════════════════════════════════════════════════
// Bounds
// ═══════════════════════════════════════════════════════════════

/// Inclusive `[min, max]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval<T> {
    pub min: T,
    pub max: T,
}

impl<T> Interval<T> {
    pub const fn new(min: T, max: T) -> Self {
        Self { min, max }
    }
}

impl Interval<u32> {
    fn sample<R: Rng>(self, rng: &mut R) -> u32 {
        rng.random_range(self.min..=self.max)
    }

    pub fn contains(&self, value: u32) -> bool {
        (self.min..=self.max).contains(&value)
    }

    fn check(&self, field: &str) -> Result<(), ParamError> {
        if self.min > self.max {
            return Err(ParamError::InvalidBounds {
                field: field.to_string(),
                min: self.min.to_string(),
                max: self.max.to_string(),
            });
        }
        Ok(())
    }
}

impl Interval<f64> {
    /// Uniform in `[min, max)`; a degenerate interval returns `min`.
    fn sample<R: Rng>(self, rng: &mut R) -> f64 {
        let span = self.max - self.min;
        if span.abs() < f64::EPSILON {
            self.min
        } else {
            (self.min + span * rng.random::<f64>()).min(self.max)
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    fn check(&self, field: &str) -> Result<(), ParamError> {
        // the span must be finite too, sampling scales by max - min
        if !self.min.is_finite() || !self.max.is_finite() || !(self.max - self.min).is_finite() {
            return Err(ParamError::NonFinite {
                field: field.to_string(),
            });
        }
        if self.min > self.max {
            return Err(ParamError::InvalidBounds {
                field: field.to_string(),
                min: self.min.to_string(),
                max: self.max.to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MotionEstimation {
    Dia,
    Hex,
    Umh,
    Esa,
}

impl MotionEstimation {
    pub fn as_str(&self) -> &'static str {
        match self {
            MotionEstimation::Dia => "dia",
            MotionEstimation::Hex => "hex",
            MotionEstimation::Umh => "umh",
            MotionEstimation::Esa => "esa",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateControl {
    /// Average bitrate with a loose peak
    Vbr,
    /// Constant bitrate (minrate = maxrate)
    Cbr,
    /// Constant quality capped at the drawn bitrate
    CappedCrf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorSpaceTag {
    Bt709,
    Bt601,
    Bt2020,
}

impl ColorSpaceTag {
    /// ffmpeg `-colorspace` / `-color_primaries` value
    pub fn as_ffmpeg(&self) -> &'static str {
        match self {
            ColorSpaceTag::Bt709 => "bt709",
            ColorSpaceTag::Bt601 => "smpte170m",
            ColorSpaceTag::Bt2020 => "bt2020nc",
        }
    }
}

/// Configured ranges for every randomized value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterBounds {
    pub video_bitrate_kbps: Interval<u32>,
    /// Jitter applied to the drawn base bitrate, percent
    pub bitrate_jitter_pct: Interval<f64>,
    pub gop_size: Interval<u32>,
    pub scenecut_threshold: Interval<u32>,
    pub motion_estimation: Vec<MotionEstimation>,
    pub rate_control: Vec<RateControl>,
    pub color_space: Vec<ColorSpaceTag>,
    pub audio_sample_rate: Vec<u32>,
    pub audio_bitrate_kbps: Interval<u32>,
    /// Visual/audio filter strengths referenced by catalog templates
    pub knobs: BTreeMap<String, Interval<f64>>,
}

impl Default for ParameterBounds {
    fn default() -> Self {
        let knobs = [
            ("crop_px", Interval::new(2.0, 8.0)),
            ("eq_gain", Interval::new(-2.0, 2.0)),
            ("gamma", Interval::new(0.94, 1.06)),
            ("hue", Interval::new(-4.0, 4.0)),
            ("noise", Interval::new(2.0, 7.0)),
            ("pad_px", Interval::new(2.0, 6.0)),
            ("pitch", Interval::new(0.98, 1.02)),
            ("rotate", Interval::new(-1.0, 1.0)),
            ("saturation", Interval::new(0.92, 1.10)),
            ("sharpen", Interval::new(0.2, 0.8)),
            ("tempo", Interval::new(0.995, 1.005)),
            ("vignette", Interval::new(0.1, 0.35)),
            ("volume", Interval::new(0.9, 1.1)),
            ("zoom", Interval::new(1.01, 1.05)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            video_bitrate_kbps: Interval::new(2500, 6000),
            bitrate_jitter_pct: Interval::new(-8.0, 8.0),
            gop_size: Interval::new(48, 250),
            scenecut_threshold: Interval::new(30, 50),
            motion_estimation: vec![
                MotionEstimation::Dia,
                MotionEstimation::Hex,
                MotionEstimation::Umh,
            ],
            rate_control: vec![RateControl::Vbr, RateControl::CappedCrf],
            color_space: vec![ColorSpaceTag::Bt709],
            audio_sample_rate: vec![44_100, 48_000],
            audio_bitrate_kbps: Interval::new(128, 192),
            knobs,
        }
    }
}

impl ParameterBounds {
    pub fn validate(self) -> Result<ValidatedBounds, ParamError> {
        self.video_bitrate_kbps.check("video_bitrate_kbps")?;
        self.bitrate_jitter_pct.check("bitrate_jitter_pct")?;
        self.gop_size.check("gop_size")?;
        self.scenecut_threshold.check("scenecut_threshold")?;
        self.audio_bitrate_kbps.check("audio_bitrate_kbps")?;

        if self.video_bitrate_kbps.min == 0 {
            return Err(ParamError::InvalidBounds {
                field: "video_bitrate_kbps".into(),
                min: "0".into(),
                max: self.video_bitrate_kbps.max.to_string(),
            });
        }

        let empty = |field: &str| ParamError::EmptyOptions {
            field: field.to_string(),
        };
        if self.motion_estimation.is_empty() {
            return Err(empty("motion_estimation"));
        }
        if self.rate_control.is_empty() {
            return Err(empty("rate_control"));
        }
        if self.color_space.is_empty() {
            return Err(empty("color_space"));
        }
        if self.audio_sample_rate.is_empty() {
            return Err(empty("audio_sample_rate"));
        }

        for (name, interval) in &self.knobs {
            interval.check(&format!("knobs.{}", name))?;
        }

        Ok(ValidatedBounds(self))
    }
}

/// Bounds that passed [`ParameterBounds::validate`]
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedBounds(ParameterBounds);

impl ValidatedBounds {
    pub fn get(&self) -> &ParameterBounds {
        &self.0
    }
}

impl Default for ValidatedBounds {
    fn default() -> Self {
        Self(ParameterBounds::default())
    }
}

// ═══════════════════════════════════════════════════════════════
// Derived parameters
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderParameters {
    pub video_bitrate_kbps: u32,
    pub gop_size: u32,
    pub scenecut_threshold: u32,
    pub motion_estimation: MotionEstimation,
    pub rate_control: RateControl,
    pub color_space: ColorSpaceTag,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioParameters {
    pub sample_rate: u32,
    pub bitrate_kbps: u32,
}

/// Everything a run needs at the encoder and filter boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    pub seed: u64,
    pub encoder: EncoderParameters,
    pub audio: AudioParameters,
    pub knobs: BTreeMap<String, f64>,
    /// Random tag written into container metadata
    pub nonce: String,
}

/// Draw a parameter set. Draw order is fixed so the output depends only on
/// `seed` and `bounds`.
pub fn derive(seed: u64, bounds: &ValidatedBounds) -> ParameterSet {
    let b = bounds.get();
    let mut rng = StdRng::seed_from_u64(seed);

    let base = b.video_bitrate_kbps.sample(&mut rng);
    let jitter = b.bitrate_jitter_pct.sample(&mut rng);
    // jitter never pushes the bitrate outside the configured band
    let jittered = (base as f64 * (1.0 + jitter / 100.0)).round();
    let video_bitrate_kbps = (jittered as u32).clamp(b.video_bitrate_kbps.min, b.video_bitrate_kbps.max);

    let encoder = EncoderParameters {
        video_bitrate_kbps,
        gop_size: b.gop_size.sample(&mut rng),
        scenecut_threshold: b.scenecut_threshold.sample(&mut rng),
        motion_estimation: pick(&mut rng, &b.motion_estimation),
        rate_control: pick(&mut rng, &b.rate_control),
        color_space: pick(&mut rng, &b.color_space),
    };

    let audio = AudioParameters {
        sample_rate: pick(&mut rng, &b.audio_sample_rate),
        bitrate_kbps: b.audio_bitrate_kbps.sample(&mut rng),
    };

    let knobs = b
        .knobs
        .iter()
        .map(|(name, interval)| (name.clone(), interval.sample(&mut rng)))
        .collect();

    let nonce = format!("{:016x}", rng.random::<u64>());

    ParameterSet {
        seed,
        encoder,
        audio,
        knobs,
        nonce,
    }
}

fn pick<T: Copy, R: Rng>(rng: &mut R, options: &[T]) -> T {
    options[rng.random_range(0..options.len())]
}

impl ParameterSet {
    pub fn knob(&self, name: &str) -> Option<f64> {
        self.knobs.get(name).copied()
    }

    fn placeholder(&self, name: &str) -> Option<String> {
        match name {
            "audio_sample_rate" => Some(self.audio.sample_rate.to_string()),
            "video_bitrate_kbps" => Some(self.encoder.video_bitrate_kbps.to_string()),
            "gop_size" => Some(self.encoder.gop_size.to_string()),
            "nonce" => Some(self.nonce.clone()),
            _ => self.knob(name).map(format_value),
        }
    }

    /// Substitute `{name}` placeholders in a catalog filter template.
    pub fn render(&self, template: &str) -> Result<String, ParamError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let close = after
                .find('}')
                .ok_or_else(|| ParamError::MalformedTemplate(template.to_string()))?;
            let name = &after[..close];
            let value = self
                .placeholder(name)
                .ok_or_else(|| ParamError::UnknownPlaceholder {
                    name: name.to_string(),
                })?;
            out.push_str(&value);
            rest = &after[close + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

/// Up to four decimals, trailing zeros dropped.
fn format_value(value: f64) -> String {
    let s = format!("{:.4}", value);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s == "-0" {
        "0".to_string()
    } else {
        s.to_string()
    }
}

impl fmt::Display for ParameterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}k gop={} sc={} me={} rc={:?} {} | audio {}Hz {}k | {} knobs",
            self.encoder.video_bitrate_kbps,
            self.encoder.gop_size,
            self.encoder.scenecut_threshold,
            self.encoder.motion_estimation.as_str(),
            self.encoder.rate_control,
            self.encoder.color_space.as_ffmpeg(),
            self.audio.sample_rate,
            self.audio.bitrate_kbps,
            self.knobs.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_is_deterministic() {
        let bounds = ParameterBounds::default().validate().unwrap();
        assert_eq!(derive(42, &bounds), derive(42, &bounds));
        assert_ne!(derive(42, &bounds).nonce, derive(43, &bounds).nonce);
    }

    #[test]
    fn test_validate_rejects_inverted_interval() {
        let bounds = ParameterBounds {
            gop_size: Interval::new(250, 48),
            ..Default::default()
        };
        assert_eq!(
            bounds.validate().unwrap_err(),
            ParamError::InvalidBounds {
                field: "gop_size".into(),
                min: "250".into(),
                max: "48".into()
            }
        );
    }

    #[test]
    fn test_validate_rejects_empty_options_and_nan() {
        let bounds = ParameterBounds {
            rate_control: vec![],
            ..Default::default()
        };
        assert!(matches!(
            bounds.validate(),
            Err(ParamError::EmptyOptions { .. })
        ));

        let mut bounds = ParameterBounds::default();
        bounds
            .knobs
            .insert("gamma".into(), Interval::new(f64::NAN, 1.0));
        assert_eq!(
            bounds.validate().unwrap_err(),
            ParamError::NonFinite {
                field: "knobs.gamma".into()
            }
        );
    }

    #[test]
    fn test_validate_rejects_overflowing_span() {
        let mut bounds = ParameterBounds::default();
        bounds
            .knobs
            .insert("zoom".into(), Interval::new(-f64::MAX, f64::MAX));
        assert_eq!(
            bounds.validate().unwrap_err(),
            ParamError::NonFinite {
                field: "knobs.zoom".into()
            }
        );

        let mut bounds = ParameterBounds::default();
        bounds
            .knobs
            .insert("zoom".into(), Interval::new(-f64::MAX / 2.0, f64::MAX / 2.0));
        let validated = bounds.validate().unwrap();
        let zoom = derive(5, &validated).knob("zoom").unwrap();
        assert!(zoom.is_finite());
    }

    #[test]
    fn test_degenerate_interval_is_fixed() {
        let mut bounds = ParameterBounds {
            video_bitrate_kbps: Interval::new(3000, 3000),
            ..Default::default()
        };
        bounds.knobs.insert("zoom".into(), Interval::new(1.02, 1.02));
        let bounds = bounds.validate().unwrap();
        for seed in 0..20 {
            let p = derive(seed, &bounds);
            assert_eq!(p.encoder.video_bitrate_kbps, 3000);
            assert_eq!(p.knob("zoom"), Some(1.02));
        }
    }

    #[test]
    fn test_render_template() {
        let bounds = ParameterBounds::default().validate().unwrap();
        let mut p = derive(7, &bounds);
        p.knobs.insert("zoom".into(), 1.25);
        p.audio.sample_rate = 48_000;
        assert_eq!(
            p.render("scale=iw*{zoom}:ih*{zoom}").unwrap(),
            "scale=iw*1.25:ih*1.25"
        );
        assert_eq!(
            p.render("asetrate={audio_sample_rate}*1.01").unwrap(),
            "asetrate=48000*1.01"
        );
        assert_eq!(p.render("hflip").unwrap(), "hflip");
        assert!(p.render("-metadata comment={nonce}").unwrap().ends_with(&p.nonce));
    }

    #[test]
    fn test_render_errors() {
        let p = derive(1, &ValidatedBounds::default());
        assert_eq!(
            p.render("volume={gain}").unwrap_err(),
            ParamError::UnknownPlaceholder { name: "gain".into() }
        );
        assert!(matches!(
            p.render("volume={volume"),
            Err(ParamError::MalformedTemplate(_))
        ));
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(1.0), "1");
        assert_eq!(format_value(0.123456), "0.1235");
        assert_eq!(format_value(-0.00001), "0");
        assert_eq!(format_value(2.5), "2.5");
    }

    #[test]
    fn test_mix_seed_spreads() {
        assert_ne!(mix_seed(42, 1), mix_seed(42, 2));
        assert_ne!(mix_seed(42, PARAMS_SALT), 42);
        assert_eq!(mix_seed(42, 1), mix_seed(42, 1));
    }
}
