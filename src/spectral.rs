//! Spectral processing utilities (STFT, flux, mel cepstrum)

use ndarray::{s, Array1, Array2, Axis};
use rustfft::{num_complex::Complex32, FftPlanner};

/// STFT data structure
#[derive(Debug, Clone)]
pub struct StftData {
    /// Complex spectrum, `[bin, frame]`
    pub s: Array2<Complex32>,
    pub freqs: Vec<f32>,
    pub times: Vec<f32>,
}

impl StftData {
    pub fn n_frames(&self) -> usize {
        self.s.shape()[1]
    }
}

/// Compute STFT of audio signal.
///
/// With `center` the signal is zero-padded by `n_fft / 2` on both sides so
/// frame `t` is centred on sample `t * hop_length`. Inputs shorter than one
/// window are zero-padded to a single frame.
pub fn stft(
    y: &[f32],
    n_fft: usize,
    hop_length: usize,
    window: &str,
    sample_rate: u32,
    center: bool,
) -> StftData {
    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(n_fft);

    let pad = if center { n_fft / 2 } else { 0 };
    let mut padded = vec![0.0f32; pad];
    padded.extend_from_slice(y);
    padded.resize((padded.len() + pad).max(n_fft), 0.0);

    let n_frames = (padded.len() - n_fft) / hop_length + 1;
    let n_bins = n_fft / 2 + 1;
    let mut s = Array2::<Complex32>::zeros((n_bins, n_frames));

    let window_fn = generate_window(window, n_fft);
    let mut frame = vec![Complex32::new(0.0, 0.0); n_fft];

    for frame_idx in 0..n_frames {
        let start = frame_idx * hop_length;
        for ((slot, &sample), &win) in frame
            .iter_mut()
            .zip(&padded[start..start + n_fft])
            .zip(&window_fn)
        {
            *slot = Complex32::new(sample * win, 0.0);
        }

        fft.process(&mut frame);

        for (i, &val) in frame[..n_bins].iter().enumerate() {
            s[[i, frame_idx]] = val;
        }
    }

    let freqs: Vec<f32> = (0..n_bins)
        .map(|i| i as f32 * sample_rate as f32 / n_fft as f32)
        .collect();

    let times: Vec<f32> = (0..n_frames)
        .map(|i| i as f32 * hop_length as f32 / sample_rate as f32)
        .collect();

    StftData { s, freqs, times }
}

/// Generate window function
fn generate_window(window_type: &str, size: usize) -> Vec<f32> {
    match window_type {
        // periodic Hann
        "hann" => (0..size)
            .map(|i| 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / size as f32).cos()))
            .collect(),
        _ => vec![1.0; size],
    }
}

/// Compute magnitude spectrogram
pub fn magnitude_spectrogram(stft_data: &StftData) -> Array2<f32> {
    stft_data.s.map(|c| c.norm())
}

/// Compute power spectrogram
pub fn power_spectrogram(stft_data: &StftData) -> Array2<f32> {
    stft_data.s.map(|c| c.norm_sqr())
}

/// Compute spectral flux (positive magnitude increases only)
pub fn spectral_flux(mag_spec: &Array2<f32>) -> Vec<f32> {
    let n_frames = mag_spec.shape()[1];
    let mut flux = vec![0.0; n_frames];

    for t in 1..n_frames {
        let prev = mag_spec.column(t - 1);
        let curr = mag_spec.column(t);
        flux[t] = curr
            .iter()
            .zip(prev.iter())
            .map(|(&c, &p)| (c - p).max(0.0))
            .sum();
    }

    flux
}

/// Bin range `[lo, hi)` covering frequencies in `[low_hz, high_hz)`
pub fn band_bins(freqs: &[f32], low_hz: f32, high_hz: f32) -> (usize, usize) {
    let lo = freqs.iter().position(|&f| f >= low_hz).unwrap_or(freqs.len());
    let hi = freqs.iter().position(|&f| f >= high_hz).unwrap_or(freqs.len());
    (lo, hi.max(lo))
}

/// Extract band-limited spectral flux
pub fn band_flux(mag_spec: &Array2<f32>, freqs: &[f32], low_hz: f32, high_hz: f32) -> Vec<f32> {
    let (lo, hi) = band_bins(freqs, low_hz, high_hz);
    if lo == hi {
        return vec![0.0; mag_spec.shape()[1]];
    }
    let band = mag_spec.slice(s![lo..hi, ..]).to_owned();
    spectral_flux(&band)
}

/// Frame-wise RMS using the same framing as [`stft`] with `center = true`
pub fn frame_rms(y: &[f32], frame_length: usize, hop_length: usize) -> Vec<f32> {
    centered_frames(y, frame_length, hop_length)
        .map(|frame| {
            let energy: f32 = frame.iter().map(|&x| x * x).sum();
            (energy / frame_length as f32).sqrt()
        })
        .collect()
}

/// Frame-wise zero-crossing rate (crossings per sample)
pub fn frame_zero_crossing_rate(y: &[f32], frame_length: usize, hop_length: usize) -> Vec<f32> {
    centered_frames(y, frame_length, hop_length)
        .map(|frame| crate::audio::zero_crossings(&frame) as f32 / frame_length as f32)
        .collect()
}

fn centered_frames(
    y: &[f32],
    frame_length: usize,
    hop_length: usize,
) -> impl Iterator<Item = Vec<f32>> + '_ {
    let pad = frame_length / 2;
    let padded_len = (y.len() + 2 * pad).max(frame_length);
    let n_frames = (padded_len - frame_length) / hop_length + 1;
    (0..n_frames).map(move |t| {
        (0..frame_length)
            .map(|i| {
                let idx = (t * hop_length + i) as isize - pad as isize;
                if idx >= 0 && (idx as usize) < y.len() {
                    y[idx as usize]
                } else {
                    0.0
                }
            })
            .collect()
    })
}

/// Frame-wise spectral flatness of a power spectrogram:
/// geometric mean over arithmetic mean, in [0, 1].
pub fn spectral_flatness(power: &Array2<f32>) -> Vec<f32> {
    const AMIN: f32 = 1e-10;
    power
        .axis_iter(Axis(1))
        .map(|col| {
            let n = col.len() as f32;
            let log_mean = col.iter().map(|&p| p.max(AMIN).ln()).sum::<f32>() / n;
            let mean = col.iter().map(|&p| p.max(AMIN)).sum::<f32>() / n;
            (log_mean.exp() / mean).clamp(0.0, 1.0)
        })
        .collect()
}

fn hz_to_mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10f32.powf(mel / 2595.0) - 1.0)
}

/// Triangular mel filterbank, `[n_mels, n_fft / 2 + 1]`
pub fn mel_filterbank(n_mels: usize, n_fft: usize, sample_rate: u32, fmin: f32, fmax: f32) -> Array2<f32> {
    let n_bins = n_fft / 2 + 1;
    let mel_min = hz_to_mel(fmin);
    let mel_max = hz_to_mel(fmax);
    let edges: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32))
        .collect();

    let mut fb = Array2::<f32>::zeros((n_mels, n_bins));
    for m in 0..n_mels {
        let (left, center, right) = (edges[m], edges[m + 1], edges[m + 2]);
        for k in 0..n_bins {
            let f = k as f32 * sample_rate as f32 / n_fft as f32;
            let w = if f >= left && f <= center && center > left {
                (f - left) / (center - left)
            } else if f > center && f <= right && right > center {
                (right - f) / (right - center)
            } else {
                0.0
            };
            fb[[m, k]] = w;
        }
    }
    fb
}

/// Mel-frequency cepstral coefficients averaged over frames.
///
/// Returns `n_mfcc` coefficients starting at c1; c0 (overall level) is
/// dropped so the vector describes spectral shape only.
pub fn mean_mfcc(power: &Array2<f32>, mel_fb: &Array2<f32>, n_mfcc: usize) -> Vec<f32> {
    let mel = mel_fb.dot(power);
    let n_mels = mel.shape()[0];

    // power to dB with an 80 dB dynamic-range floor
    let mut log_mel = mel.mapv(|p| 10.0 * p.max(1e-10).log10());
    let max_db = log_mel.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    log_mel.mapv_inplace(|v| v.max(max_db - 80.0));

    let mean_log: Array1<f32> = log_mel
        .mean_axis(Axis(1))
        .unwrap_or_else(|| Array1::zeros(n_mels));

    (1..=n_mfcc).map(|k| dct2_ortho(&mean_log, k)).collect()
}

/// One orthonormal DCT-II coefficient
fn dct2_ortho(x: &Array1<f32>, k: usize) -> f32 {
    let n = x.len() as f32;
    let scale = if k == 0 { (1.0 / n).sqrt() } else { (2.0 / n).sqrt() };
    let sum: f32 = x
        .iter()
        .enumerate()
        .map(|(i, &v)| v * (std::f32::consts::PI * k as f32 * (2.0 * i as f32 + 1.0) / (2.0 * n)).cos())
        .sum();
    scale * sum
}
