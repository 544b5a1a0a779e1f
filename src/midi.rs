//! MIDI export of the event grid

use crate::analysis::EventGrid;
use crate::error::{PipelineError, Result};
use midly::num::{u15, u24, u28, u4, u7};
use midly::{Format, Header, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// General MIDI percussion channel (10, zero-based 9)
const DRUM_CHANNEL: u8 = 9;

/// Tick positions derived from the grid and the file resolution
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickMap {
    pub ppq: u16,
    /// Microseconds per quarter note
    pub tempo_uspq: u32,
    pub ticks_per_bar: f64,
    pub ticks_per_step: f64,
}

impl TickMap {
    pub fn new(grid: &crate::config::GridConfig, ppq: u16) -> Self {
        let quarters_per_beat = 4.0 / grid.meter_denominator as f64;
        let tempo_uspq = (60_000_000.0 / grid.bpm / quarters_per_beat).round() as u32;
        let ticks_per_bar = grid.meter_numerator as f64 * quarters_per_beat * ppq as f64;
        Self {
            ppq,
            tempo_uspq,
            ticks_per_bar,
            ticks_per_step: ticks_per_bar / grid.steps_per_bar as f64,
        }
    }

    pub fn ticks_per_ms(&self) -> f64 {
        self.ppq as f64 * 1000.0 / self.tempo_uspq as f64
    }

    pub fn tick_at(&self, bar: u32, step: u32, offset_ms: f32) -> u32 {
        let tick = bar as f64 * self.ticks_per_bar
            + step as f64 * self.ticks_per_step
            + offset_ms as f64 * self.ticks_per_ms();
        tick.round().max(0.0) as u32
    }
}

/// Map a [0, 1] velocity onto MIDI's audible range
pub fn midi_velocity(velocity: f32) -> u8 {
    (velocity * 127.0).round().clamp(1.0, 127.0) as u8
}

fn note_event(note: u8, velocity: u8, on: bool) -> TrackEventKind<'static> {
    let key = u7::from(note);
    let message = if on {
        MidiMessage::NoteOn {
            key,
            vel: u7::from(velocity),
        }
    } else {
        MidiMessage::NoteOff {
            key,
            vel: u7::from(0),
        }
    };
    TrackEventKind::Midi {
        channel: u4::from(DRUM_CHANNEL),
        message,
    }
}

/// Render the grid as a single-track SMF
pub fn event_grid_to_midi(grid: &EventGrid, ppq: u16) -> Result<Vec<u8>> {
    let ticks = TickMap::new(&grid.grid, ppq);
    let log2_den = grid.grid.meter_denominator.trailing_zeros() as u8;

    // note -> (start tick, end tick, velocity)
    let mut strikes: BTreeMap<u8, Vec<(u32, u32, u8)>> = BTreeMap::new();
    for event in &grid.events {
        let start = ticks.tick_at(event.bar, event.step, event.micro_offset_ms);
        let length = (event.duration_steps as f64 * ticks.ticks_per_step).round().max(1.0) as u32;
        strikes
            .entry(event.role.midi_note())
            .or_default()
            .push((start, start + length, midi_velocity(event.velocity)));
    }

    // (absolute tick, note-offs before note-ons, event)
    let mut timed: Vec<(u32, u8, TrackEventKind<'static>)> = Vec::with_capacity(grid.events.len() * 2);
    for (note, mut notes) in strikes {
        // one strike per tick, the loudest
        notes.sort_by_key(|&(start, _, velocity)| (start, std::cmp::Reverse(velocity)));
        notes.dedup_by_key(|strike| strike.0);
        for (i, &(start, end, velocity)) in notes.iter().enumerate() {
            // a re-strike of the same key closes the ringing note first
            let end = notes.get(i + 1).map_or(end, |next| end.min(next.0));
            timed.push((start, 1, note_event(note, velocity, true)));
            timed.push((end, 0, note_event(note, 0, false)));
        }
    }
    timed.sort_by_key(|&(tick, order, _)| (tick, order));

    let mut track = vec![
        TrackEvent {
            delta: u28::from(0),
            kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::from(ticks.tempo_uspq))),
        },
        TrackEvent {
            delta: u28::from(0),
            kind: TrackEventKind::Meta(MetaMessage::TimeSignature(
                grid.grid.meter_numerator.min(255) as u8,
                log2_den,
                24,
                8,
            )),
        },
    ];

    let mut current = 0u32;
    for (tick, _, kind) in timed {
        track.push(TrackEvent {
            delta: u28::from(tick - current),
            kind,
        });
        current = tick;
    }
    track.push(TrackEvent {
        delta: u28::from(0),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });

    let smf = Smf {
        header: Header {
            format: Format::SingleTrack,
            timing: Timing::Metrical(u15::from(ppq)),
        },
        tracks: vec![track],
    };

    let mut bytes = Vec::new();
    smf.write(&mut bytes)
        .map_err(|e| PipelineError::MidiExport(format!("{:?}", e)))?;
    Ok(bytes)
}

/// Write `event_grid.mid` into `output_dir`
pub fn export_midi(grid: &EventGrid, output_dir: &Path, ppq: u16) -> Result<Option<PathBuf>> {
    if grid.events.is_empty() {
        warn!("no events to export as MIDI");
        return Ok(None);
    }

    std::fs::create_dir_all(output_dir)?;
    let midi_path = output_dir.join("event_grid.mid");
    let bytes = event_grid_to_midi(grid, ppq)?;
    std::fs::write(&midi_path, bytes)?;

    info!(
        events = grid.events.len(),
        path = %midi_path.display(),
        "exported MIDI"
    );
    Ok(Some(midi_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{Event, EventSource, Role};
    use crate::config::GridConfig;

    fn motion(step: u32, duration_steps: u32) -> Event {
        Event {
            bar: 0,
            step,
            role: Role::Motion,
            sample_id: "hat".to_string(),
            velocity: 0.5,
            duration_steps,
            micro_offset_ms: 0.0,
            source: EventSource::Skeleton,
        }
    }

    /// (absolute tick, is note-on) for every note message in the first track
    fn note_timeline(bytes: &[u8]) -> Vec<(u32, bool)> {
        let smf = Smf::parse(bytes).unwrap();
        let mut tick = 0u32;
        let mut out = Vec::new();
        for event in &smf.tracks[0] {
            tick += event.delta.as_int();
            if let TrackEventKind::Midi { message, .. } = event.kind {
                match message {
                    MidiMessage::NoteOn { .. } => out.push((tick, true)),
                    MidiMessage::NoteOff { .. } => out.push((tick, false)),
                    _ => {}
                }
            }
        }
        out
    }

    #[test]
    fn test_tick_map_four_four() {
        let ticks = TickMap::new(&GridConfig::default(), 960);
        assert_eq!(ticks.tempo_uspq, 500_000);
        assert_eq!(ticks.ticks_per_bar, 3840.0);
        assert_eq!(ticks.ticks_per_step, 240.0);
        assert_eq!(ticks.tick_at(1, 2, 0.0), 4320);
        // 10 ms at 120 bpm is 19.2 ticks
        assert_eq!(ticks.tick_at(0, 0, 10.0), 19);
        assert_eq!(ticks.tick_at(0, 0, -10.0), 0);
    }

    #[test]
    fn test_eighth_note_meter_tempo() {
        let grid = GridConfig {
            meter_numerator: 6,
            meter_denominator: 8,
            steps_per_bar: 12,
            ..GridConfig::default()
        };
        let ticks = TickMap::new(&grid, 960);
        // 120 eighth notes per minute is 60 quarters per minute
        assert_eq!(ticks.tempo_uspq, 1_000_000);
        assert_eq!(ticks.ticks_per_bar, 2880.0);
    }

    #[test]
    fn test_velocity_range() {
        assert_eq!(midi_velocity(0.0), 1);
        assert_eq!(midi_velocity(1.0), 127);
        assert_eq!(midi_velocity(0.5), 64);
    }

    #[test]
    fn test_restrike_closes_ringing_note() {
        let grid = EventGrid {
            grid: GridConfig::default(),
            events: vec![motion(0, 2), motion(1, 1)],
        };
        let bytes = event_grid_to_midi(&grid, 960).unwrap();
        assert_eq!(
            note_timeline(&bytes),
            vec![(0, true), (240, false), (240, true), (480, false)]
        );
    }

    #[test]
    fn test_same_tick_strikes_collapse() {
        let mut loud = motion(4, 1);
        loud.velocity = 1.0;
        let grid = EventGrid {
            grid: GridConfig::default(),
            events: vec![motion(4, 1), loud],
        };
        let bytes = event_grid_to_midi(&grid, 960).unwrap();
        assert_eq!(note_timeline(&bytes), vec![(960, true), (1200, false)]);
        assert!(bytes.windows(3).any(|w| w == [0x99, 42, 127]));
    }
}
