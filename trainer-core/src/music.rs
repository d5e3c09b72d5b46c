//! # Music Theory Module
//!
//! Pure conversions between frequencies, MIDI numbers, note names and cents.
//! Everything uses twelve-tone equal temperament anchored at A4 = 440 Hz, with
//! scientific octave numbering rooted at C0 (A4 × 2^-4.75 ≈ 16.35 Hz).
//!
//! ## Features
//! - Frequency ↔ MIDI ↔ note name conversions (sharp and flat spellings)
//! - Signed cent deviation from the nearest semitone
//! - Interval naming and semitone distances
//! - Harmonic series generation and harmonic membership tests
//! - Scale generation for exercise material

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Reference pitch for A4 in Hz.
pub const A4_FREQUENCY: f32 = 440.0;

/// MIDI number of A4.
pub const A4_MIDI: i32 = 69;

/// Lower bound of the vocal range accepted by `is_in_vocal_range`.
pub const VOCAL_RANGE_MIN: f32 = 80.0;

/// Upper bound of the vocal range accepted by `is_in_vocal_range`.
pub const VOCAL_RANGE_MAX: f32 = 1100.0;

/// Placeholder shown by consumers when no pitch is present.
pub const NO_NOTE: &str = "--";

pub const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

pub const FLAT_NOTE_NAMES: [&str; 12] = [
    "C", "Db", "D", "Eb", "E", "F", "Gb", "G", "Ab", "A", "Bb", "B",
];

/// Pitch class lookup for both spellings, built once.
static PITCH_CLASSES: Lazy<HashMap<&'static str, i32>> = Lazy::new(|| {
    let mut map = HashMap::with_capacity(17);
    for (class, name) in NOTE_NAMES.iter().enumerate() {
        map.insert(*name, class as i32);
    }
    for (class, name) in FLAT_NOTE_NAMES.iter().enumerate() {
        map.insert(*name, class as i32);
    }
    map
});

/// Frequency of C0, the root of octave numbering.
static C0_FREQUENCY: Lazy<f32> = Lazy::new(|| A4_FREQUENCY * 2.0_f32.powf(-4.75));

/// A frequency resolved to its nearest equal-tempered note.
#[derive(Debug, Clone, PartialEq)]
pub struct NoteInfo {
    /// Note name with octave, e.g. "C#4".
    pub name: String,
    /// Pitch class, 0 = C … 11 = B.
    pub pitch_class: u8,
    /// Octave number (C0-rooted).
    pub octave: i32,
    /// MIDI number of the nearest note.
    pub midi: i32,
    /// Signed deviation from the nearest note in cents (-50..=50).
    pub cents: f32,
    /// Exact frequency of the nearest note in Hz.
    pub frequency: f32,
}

/// Named interval description.
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalInfo {
    pub name: String,
    pub semitones: i32,
    pub cents: i32,
    pub ratio: f32,
}

/// Returns the frequency of C0 (≈16.35 Hz).
pub fn c0_frequency() -> f32 {
    *C0_FREQUENCY
}

/// Continuous MIDI value for a frequency (69.0 = A4). `None` for non-positive input.
pub fn frequency_to_midi_exact(freq: f32) -> Option<f32> {
    if freq <= 0.0 || !freq.is_finite() {
        return None;
    }
    Some(12.0 * (freq / A4_FREQUENCY).log2() + A4_MIDI as f32)
}

/// Nearest MIDI note number for a frequency.
pub fn frequency_to_midi(freq: f32) -> Option<i32> {
    frequency_to_midi_exact(freq).map(|m| m.round() as i32)
}

/// Equal-tempered frequency of a MIDI note number.
pub fn midi_to_frequency(midi: i32) -> f32 {
    A4_FREQUENCY * 2.0_f32.powf((midi - A4_MIDI) as f32 / 12.0)
}

/// Builds the note name ("C4", "Bb3") for a MIDI number.
pub fn midi_to_note_name(midi: i32, use_flats: bool) -> String {
    let class = midi.rem_euclid(12) as usize;
    let octave = midi.div_euclid(12) - 1;
    let names = if use_flats { &FLAT_NOTE_NAMES } else { &NOTE_NAMES };
    format!("{}{}", names[class], octave)
}

/// Finds the nearest note to a frequency together with the signed cent offset.
///
/// # Returns
/// * `Some(NoteInfo)` - Nearest note, octave and deviation
/// * `None` - Frequency is zero, negative or not finite
pub fn frequency_to_note(freq: f32) -> Option<NoteInfo> {
    let exact = frequency_to_midi_exact(freq)?;
    let midi = exact.round() as i32;
    Some(NoteInfo {
        name: midi_to_note_name(midi, false),
        pitch_class: midi.rem_euclid(12) as u8,
        octave: midi.div_euclid(12) - 1,
        midi,
        cents: (exact - midi as f32) * 100.0,
        frequency: midi_to_frequency(midi),
    })
}

/// Parses a note name such as "A4", "C#3", "Bb2" or "C-1" into a MIDI number.
pub fn note_name_to_midi(name: &str) -> Option<i32> {
    let name = name.trim();
    let split = name
        .char_indices()
        .skip(1)
        .find(|(_, c)| c.is_ascii_digit() || *c == '-')
        .map(|(i, _)| i)?;
    let (class_part, octave_part) = name.split_at(split);
    let class = *PITCH_CLASSES.get(class_part)?;
    let octave: i32 = octave_part.parse().ok()?;
    octave.checked_add(1)?.checked_mul(12)?.checked_add(class)
}

/// Converts a note name to its equal-tempered frequency.
///
/// # Returns
/// * `Some(frequency)` - Frequency in Hz
/// * `None` - The name could not be parsed
pub fn note_to_frequency(name: &str) -> Option<f32> {
    note_name_to_midi(name).map(midi_to_frequency)
}

/// Calculates the deviation from a target frequency in cents.
///
/// Positive values are sharp, negative values flat. 100 cents = 1 semitone.
pub fn calculate_cents_deviation(freq: f32, target_freq: f32) -> f32 {
    1200.0 * (freq / target_freq).log2()
}

/// Signed deviation of a frequency from its nearest semitone, in cents.
pub fn cents_from_nearest(freq: f32) -> Option<f32> {
    frequency_to_note(freq).map(|note| note.cents)
}

pub fn ratio_to_cents(ratio: f32) -> f32 {
    if ratio <= 0.0 {
        return 0.0;
    }
    1200.0 * ratio.log2()
}

pub fn cents_to_ratio(cents: f32) -> f32 {
    2.0_f32.powf(cents / 1200.0)
}

/// Fractional semitone distance from `from` to `to` (positive when `to` is higher).
pub fn semitone_distance(from: f32, to: f32) -> Option<f32> {
    if from <= 0.0 || to <= 0.0 {
        return None;
    }
    Some(12.0 * (to / from).log2())
}

/// Signed distance between the nearest notes of two frequencies, in semitones.
pub fn signed_interval(from: f32, to: f32) -> Option<i32> {
    Some(frequency_to_midi(to)? - frequency_to_midi(from)?)
}

/// Absolute distance between the nearest notes of two frequencies, in semitones.
pub fn interval(from: f32, to: f32) -> Option<i32> {
    signed_interval(from, to).map(i32::abs)
}

/// Names an interval given in semitones.
pub fn interval_info(semitones: i32) -> IntervalInfo {
    const NAMES: [&str; 12] = [
        "Perfect Unison",
        "Minor Second",
        "Major Second",
        "Minor Third",
        "Major Third",
        "Perfect Fourth",
        "Tritone",
        "Perfect Fifth",
        "Minor Sixth",
        "Major Sixth",
        "Minor Seventh",
        "Major Seventh",
    ];
    let span = semitones.abs();
    let octaves = span / 12;
    let class = (span % 12) as usize;
    let name = match (class, octaves) {
        (0, 1) => "Perfect Octave".to_string(),
        (_, 0) => NAMES[class].to_string(),
        (_, n) => format!("{} + {} octave(s)", NAMES[class], n),
    };
    IntervalInfo {
        name,
        semitones,
        cents: semitones * 100,
        ratio: 2.0_f32.powf(semitones as f32 / 12.0),
    }
}

/// Harmonic series of a fundamental: `[f, 2f, 3f, … count·f]`.
pub fn harmonic_series(fundamental: f32, count: u32) -> Vec<f32> {
    (1..=count).map(|n| fundamental * n as f32).collect()
}

/// Tests whether `freq` is plausibly the Nth harmonic of `fundamental`.
///
/// `tolerance` is the allowed distance of `freq / fundamental` from the
/// nearest integer (e.g. 0.05).
///
/// # Returns
/// * `Some(n)` - The harmonic number
/// * `None` - Not a harmonic within tolerance
pub fn harmonic_number(freq: f32, fundamental: f32, tolerance: f32) -> Option<u32> {
    if freq <= 0.0 || fundamental <= 0.0 {
        return None;
    }
    let ratio = freq / fundamental;
    let nearest = ratio.round();
    if nearest >= 1.0 && (ratio - nearest).abs() <= tolerance {
        Some(nearest as u32)
    } else {
        None
    }
}

pub fn is_harmonic(freq: f32, fundamental: f32, tolerance: f32) -> bool {
    harmonic_number(freq, fundamental, tolerance).is_some()
}

/// Fundamental implied by a frequency assumed to be its Nth harmonic.
pub fn fundamental_of(freq: f32, harmonic: u32) -> f32 {
    if harmonic == 0 || freq <= 0.0 {
        return 0.0;
    }
    freq / harmonic as f32
}

pub fn is_in_vocal_range(freq: f32) -> bool {
    (VOCAL_RANGE_MIN..=VOCAL_RANGE_MAX).contains(&freq)
}

fn scale_from_steps(root: f32, steps: &[i32]) -> Vec<f32> {
    steps
        .iter()
        .map(|&s| root * 2.0_f32.powf(s as f32 / 12.0))
        .collect()
}

/// Every semitone starting at `root`, spanning `octaves` octaves (root included, top excluded).
pub fn chromatic_scale(root: f32, octaves: u32) -> Vec<f32> {
    let steps: Vec<i32> = (0..(12 * octaves as i32)).collect();
    scale_from_steps(root, &steps)
}

/// Major scale from `root` up to and including its octave.
pub fn major_scale(root: f32) -> Vec<f32> {
    scale_from_steps(root, &[0, 2, 4, 5, 7, 9, 11, 12])
}

/// Natural minor scale from `root` up to and including its octave.
pub fn minor_scale(root: f32) -> Vec<f32> {
    scale_from_steps(root, &[0, 2, 3, 5, 7, 8, 10, 12])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn anchors_and_octave_root() {
        assert_relative_eq!(midi_to_frequency(69), 440.0, epsilon = 1e-3);
        assert_relative_eq!(c0_frequency(), 16.3516, epsilon = 1e-3);
        assert_relative_eq!(midi_to_frequency(12), c0_frequency(), epsilon = 1e-3);
        assert_eq!(midi_to_note_name(12, false), "C0");
        assert_eq!(midi_to_note_name(0, false), "C-1");
    }

    #[test]
    fn parses_sharps_flats_and_negative_octaves() {
        assert_eq!(note_name_to_midi("C4"), Some(60));
        assert_eq!(note_name_to_midi("C#4"), Some(61));
        assert_eq!(note_name_to_midi("Db4"), Some(61));
        assert_eq!(note_name_to_midi("Bb2"), Some(46));
        assert_eq!(note_name_to_midi("C-1"), Some(0));
        assert_eq!(note_name_to_midi("H4"), None);
        assert_eq!(note_name_to_midi("C"), None);
        assert_eq!(note_name_to_midi(""), None);
        assert_eq!(note_name_to_midi("C2147483647"), None);
        assert_eq!(note_name_to_midi("B178956970"), None);
        assert_eq!(note_name_to_midi("C-2147483648"), None);
        assert_relative_eq!(note_to_frequency("A4").unwrap(), 440.0, epsilon = 1e-3);
    }

    #[test]
    fn cents_for_exact_and_semitone_above() {
        let c4 = note_to_frequency("C4").unwrap();
        let note = frequency_to_note(c4).unwrap();
        assert_eq!(note.name, "C4");
        assert!(note.cents.abs() < 0.01);

        // A semitone above C4 is C#4 at 0 cents, +100 cents relative to C4.
        let above = c4 * 2.0_f32.powf(1.0 / 12.0);
        assert_relative_eq!(calculate_cents_deviation(above, c4), 100.0, epsilon = 0.01);
        assert_eq!(frequency_to_note(above).unwrap().name, "C#4");
    }

    #[test]
    fn c4_tone_resolves() {
        let note = frequency_to_note(261.63).unwrap();
        assert_eq!(note.name, "C4");
        assert_eq!(note.octave, 4);
        assert!(note.cents.abs() < 0.1);
    }

    #[test]
    fn no_note_for_silence() {
        assert!(frequency_to_note(0.0).is_none());
        assert!(frequency_to_note(-3.0).is_none());
        assert!(frequency_to_midi(f32::NAN).is_none());
    }

    #[test]
    fn intervals() {
        assert_eq!(signed_interval(261.63, 392.0), Some(7));
        assert_eq!(signed_interval(392.0, 261.63), Some(-7));
        assert_eq!(interval(392.0, 261.63), Some(7));
        assert_eq!(interval_info(7).name, "Perfect Fifth");
        assert_eq!(interval_info(12).name, "Perfect Octave");
        assert_eq!(interval_info(19).name, "Perfect Fifth + 1 octave(s)");
        assert_relative_eq!(semitone_distance(220.0, 440.0).unwrap(), 12.0, epsilon = 1e-4);
    }

    #[test]
    fn harmonic_membership() {
        assert_eq!(harmonic_series(110.0, 4), vec![110.0, 220.0, 330.0, 440.0]);
        assert_eq!(harmonic_number(330.0, 110.0, 0.05), Some(3));
        assert_eq!(harmonic_number(350.0, 110.0, 0.05), None);
        assert!(is_harmonic(441.0, 220.0, 0.05));
        assert!(!is_harmonic(55.0, 110.0, 0.05));
        assert_relative_eq!(fundamental_of(660.0, 3), 220.0);
    }

    #[test]
    fn scales_span_an_octave() {
        let major = major_scale(261.63);
        assert_eq!(major.len(), 8);
        assert_relative_eq!(major[7], 523.26, epsilon = 0.01);
        assert_eq!(chromatic_scale(220.0, 2).len(), 24);
        assert_eq!(frequency_to_note(minor_scale(220.0)[2]).unwrap().name, "C4");
    }

    proptest! {
        #[test]
        fn note_round_trip_within_a_cent(midi in 35i32..=79) {
            // Every note whose frequency lies in the 60-800 Hz training band.
            let name = midi_to_note_name(midi, false);
            let freq = note_to_frequency(&name).unwrap();
            let note = frequency_to_note(freq).unwrap();
            prop_assert_eq!(&note.name, &name);
            prop_assert!(note.cents.abs() < 1.0);
        }

        #[test]
        fn nearest_note_is_within_half_semitone(freq in 60.0f32..800.0) {
            let note = frequency_to_note(freq).unwrap();
            prop_assert!(note.cents.abs() <= 50.01);
            let back = calculate_cents_deviation(freq, note.frequency);
            prop_assert!((back - note.cents).abs() < 0.05);
        }
    }
}
