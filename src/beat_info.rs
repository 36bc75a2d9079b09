//! Beat synchronization service.
//!
//! Subscribes to a device's beat stream and forwards beat snapshots to a
//! user callback, throttled to beat-bucket granularity: a message is only
//! forwarded when at least one player's beat counter moves into a different
//! bucket of `every_n_beats` beats.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use crate::context::{ReadContext, WriteContext};
use crate::service::{self, ServiceHandle, ServiceHandler, ServiceMessage};
use crate::{Error, Result};

/// Fixed subscription request: command id 4, zero-length payload.
const SUBSCRIBE_REQUEST: [u8; 8] = [0, 0, 0, 4, 0, 0, 0, 0];

/// Per-player beat position snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlayerBeatData {
    pub beat: f64,
    pub total_beats: f64,
    pub bpm: f64,
    /// Sample offset, carried in the frame's trailing per-player pass.
    pub samples: f64,
}

/// One beat-info frame across all players.
#[derive(Debug, Clone, PartialEq)]
pub struct BeatData {
    pub clock: u64,
    pub player_count: u32,
    pub players: Vec<PlayerBeatData>,
}

/// Beat callback throttling options.
#[derive(Debug, Clone, Copy)]
pub struct BeatOptions {
    every_n_beats: u32,
}

impl BeatOptions {
    /// Bucket size the callback is throttled to. Zero would degenerate the
    /// bucket test and is rejected up front.
    pub fn every_n_beats(n: u32) -> Result<Self> {
        if n == 0 {
            return Err(Error::Config(
                "every_n_beats must be greater than zero".to_string(),
            ));
        }
        Ok(Self { every_n_beats: n })
    }
}

/// Callback invoked for each forwarded beat snapshot.
pub type BeatCallback = Box<dyn FnMut(&BeatData) + Send>;

/// Handler for the beat message family with change-detection filtering.
pub struct BeatInfoHandler {
    options: BeatOptions,
    callback: BeatCallback,
    current: Option<BeatData>,
}

impl BeatInfoHandler {
    pub fn new(options: BeatOptions, callback: BeatCallback) -> Self {
        Self {
            options,
            callback,
            current: None,
        }
    }

    /// True when any player index moved into a different beat bucket, in
    /// either direction. A change in player count also counts: index-wise
    /// comparison is impossible across it.
    fn crossed_boundary(&self, current: &BeatData, next: &BeatData) -> bool {
        if current.players.len() != next.players.len() {
            return true;
        }
        let n = f64::from(self.options.every_n_beats);
        current
            .players
            .iter()
            .zip(&next.players)
            .any(|(cur, new)| (cur.beat / n).floor() != (new.beat / n).floor())
    }
}

impl ServiceHandler for BeatInfoHandler {
    const NAME: &'static str = "BeatInfo";
    type Message = BeatData;

    fn parse(&mut self, ctx: &mut ReadContext) -> Result<ServiceMessage<BeatData>> {
        parse_beat_frame(ctx)
    }

    fn handle(&mut self, message: ServiceMessage<BeatData>) {
        let next = message.message;
        let forward = match &self.current {
            // The first message ever received is always forwarded.
            None => true,
            Some(current) => self.crossed_boundary(current, &next),
        };
        if forward {
            trace!(
                clock = next.clock,
                players = next.players.len(),
                "Beat bucket crossed"
            );
            (self.callback)(&next);
            self.current = Some(next);
        }
    }
}

/// Decodes one beat frame.
///
/// Layout after the framing header: u32 message id, u64 clock, u32 player
/// count, then per player (beat, total_beats, bpm) doubles in a first pass,
/// then one samples double per player in a second pass. The split passes are
/// the wire layout, not a convenience.
pub(crate) fn parse_beat_frame(ctx: &mut ReadContext) -> Result<ServiceMessage<BeatData>> {
    if ctx.size_left() <= 72 {
        return Err(Error::Decode {
            service: BeatInfoHandler::NAME,
            message_id: None,
            detail: format!("frame too short: {} bytes", ctx.size_left()),
        });
    }
    let id = ctx.read_u32()?;
    let clock = ctx.read_u64()?;
    let player_count = ctx.read_u32()?;

    // Each player needs 32 more bytes across the two passes.
    if (player_count as usize).saturating_mul(32) > ctx.size_left() {
        return Err(Error::Decode {
            service: BeatInfoHandler::NAME,
            message_id: Some(id),
            detail: format!(
                "player count {player_count} exceeds the {} bytes left",
                ctx.size_left()
            ),
        });
    }

    let mut players = Vec::with_capacity(player_count as usize);
    for _ in 0..player_count {
        players.push(PlayerBeatData {
            beat: ctx.read_f64()?,
            total_beats: ctx.read_f64()?,
            bpm: ctx.read_f64()?,
            samples: 0.0,
        });
    }
    for player in &mut players {
        player.samples = ctx.read_f64()?;
    }

    Ok(ServiceMessage {
        id,
        message: BeatData {
            clock,
            player_count,
            players,
        },
    })
}

/// Beat synchronization entry point.
pub struct BeatInfo;

impl BeatInfo {
    /// Registers the callback and threshold, immediately sends the
    /// subscription request, then spawns the session read loop on the
    /// supplied socket.
    pub async fn start<S>(
        options: BeatOptions,
        callback: BeatCallback,
        socket: S,
    ) -> Result<ServiceHandle>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(socket);

        let mut ctx = WriteContext::with_capacity(SUBSCRIBE_REQUEST.len());
        ctx.write_bytes(&SUBSCRIBE_REQUEST);
        service::write(ctx, &mut write_half).await?;
        debug!("TX: beat-info subscribe");

        let handler = BeatInfoHandler::new(options, callback);
        Ok(service::spawn(handler, read_half))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn encode_beat_frame(id: u32, clock: u64, players: &[PlayerBeatData]) -> ReadContext {
        let mut ctx = WriteContext::new();
        ctx.write_u32(id);
        ctx.write_u64(clock);
        ctx.write_u32(players.len() as u32);
        for player in players {
            ctx.write_f64(player.beat);
            ctx.write_f64(player.total_beats);
            ctx.write_f64(player.bpm);
        }
        for player in players {
            ctx.write_f64(player.samples);
        }
        ReadContext::new(ctx.into_bytes())
    }

    fn player(beat: f64) -> PlayerBeatData {
        PlayerBeatData {
            beat,
            total_beats: 512.0,
            bpm: 128.0,
            samples: beat * 22050.0,
        }
    }

    fn collecting_handler(every_n_beats: u32) -> (BeatInfoHandler, Arc<Mutex<Vec<BeatData>>>) {
        let forwarded = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&forwarded);
        let handler = BeatInfoHandler::new(
            BeatOptions::every_n_beats(every_n_beats).unwrap(),
            Box::new(move |data| sink.lock().unwrap().push(data.clone())),
        );
        (handler, forwarded)
    }

    fn beats(values: &[f64]) -> ServiceMessage<BeatData> {
        let players: Vec<_> = values.iter().map(|&b| player(b)).collect();
        ServiceMessage {
            id: 0,
            message: BeatData {
                clock: 1,
                player_count: players.len() as u32,
                players,
            },
        }
    }

    #[test]
    fn round_trip_decode_consumes_cursor_exactly() {
        let players = [
            PlayerBeatData {
                beat: 7.25,
                total_beats: 1024.0,
                bpm: 174.0,
                samples: 320_000.5,
            },
            PlayerBeatData {
                beat: -3.5,
                total_beats: 256.0,
                bpm: 89.9,
                samples: 0.25,
            },
        ];
        let mut ctx = encode_beat_frame(0x0096_0000, 0xdead_beef_cafe, &players);

        let decoded = parse_beat_frame(&mut ctx).unwrap();
        assert!(ctx.is_eof());
        assert_eq!(decoded.id, 0x0096_0000);
        assert_eq!(decoded.message.clock, 0xdead_beef_cafe);
        assert_eq!(decoded.message.player_count, 2);
        assert_eq!(decoded.message.players, players);
    }

    #[test]
    fn short_frame_is_rejected() {
        // One player encodes to 48 bytes, below the 73-byte floor.
        let mut ctx = encode_beat_frame(0, 1, &[player(4.0)]);
        match parse_beat_frame(&mut ctx) {
            Err(Error::Decode { service, .. }) => assert_eq!(service, "BeatInfo"),
            other => panic!("expected decode fault, got {other:?}"),
        }
    }

    #[test]
    fn oversized_player_count_is_rejected() {
        let mut ctx = WriteContext::new();
        ctx.write_u32(0);
        ctx.write_u64(1);
        ctx.write_u32(u32::MAX);
        ctx.write_bytes(&[0u8; 64]);
        let mut ctx = ReadContext::new(ctx.into_bytes());

        match parse_beat_frame(&mut ctx) {
            Err(Error::Decode { message_id, .. }) => assert_eq!(message_id, Some(0)),
            other => panic!("expected decode fault, got {other:?}"),
        }
    }

    #[test]
    fn first_message_is_always_forwarded() {
        let (mut handler, forwarded) = collecting_handler(4);
        handler.handle(beats(&[1.0, 2.0]));
        assert_eq!(forwarded.lock().unwrap().len(), 1);
    }

    #[test]
    fn same_bucket_messages_are_dropped() {
        let (mut handler, forwarded) = collecting_handler(4);
        handler.handle(beats(&[5.0, 1.0]));
        // Both players stay inside their bucket of 4.
        handler.handle(beats(&[6.5, 3.9]));
        handler.handle(beats(&[4.1, 0.2]));
        assert_eq!(forwarded.lock().unwrap().len(), 1);
    }

    #[test]
    fn any_player_crossing_a_boundary_forwards() {
        let (mut handler, forwarded) = collecting_handler(4);
        handler.handle(beats(&[7.9, 1.0]));
        // Player 0 crosses the multiple-of-4 boundary; player 1 does not.
        handler.handle(beats(&[8.1, 1.5]));
        assert_eq!(forwarded.lock().unwrap().len(), 2);
        assert_eq!(forwarded.lock().unwrap()[1].players[0].beat, 8.1);
    }

    #[test]
    fn forwarded_message_becomes_the_new_baseline() {
        let (mut handler, forwarded) = collecting_handler(4);
        handler.handle(beats(&[7.9]));
        handler.handle(beats(&[8.1]));
        // Same bucket as the new baseline 8.1, not the original 7.9.
        handler.handle(beats(&[9.0]));
        assert_eq!(forwarded.lock().unwrap().len(), 2);
    }

    #[test]
    fn backwards_bucket_crossing_forwards() {
        let (mut handler, forwarded) = collecting_handler(4);
        handler.handle(beats(&[8.1]));
        handler.handle(beats(&[7.9]));
        assert_eq!(forwarded.lock().unwrap().len(), 2);
    }

    #[test]
    fn player_count_change_forwards() {
        let (mut handler, forwarded) = collecting_handler(4);
        handler.handle(beats(&[1.0, 2.0]));
        handler.handle(beats(&[1.0]));
        assert_eq!(forwarded.lock().unwrap().len(), 2);
    }

    #[test]
    fn zero_threshold_is_rejected() {
        assert!(BeatOptions::every_n_beats(0).is_err());
        assert!(BeatOptions::every_n_beats(4).is_ok());
    }
}
