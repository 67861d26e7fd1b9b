//! Property tests for framing and the handshake exchange.

use nixie_link::domain::commands::OutgoingCommand;
use nixie_link::domain::handshake::{Handshake, HandshakeAction};
use nixie_link::domain::models::{Frame, HandshakeState, LinkEvent};
use nixie_link::infrastructure::bluetooth::frame_reader::FrameBuffer;
use proptest::prelude::*;
use proptest::sample::Index;

fn wire_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(prop_oneof![3 => any::<u8>(), 1 => Just(b'\n')], 0..512)
}

fn split_at_points(data: &[u8], points: &[Index]) -> Vec<Vec<u8>> {
    let mut cuts: Vec<usize> = points.iter().map(|i| i.index(data.len() + 1)).collect();
    cuts.sort_unstable();

    let mut chunks = Vec::new();
    let mut start = 0;
    for cut in cuts {
        chunks.push(data[start..cut].to_vec());
        start = cut;
    }
    chunks.push(data[start..].to_vec());
    chunks
}

fn frames_in_chunks(max_frame_len: usize, chunks: &[Vec<u8>]) -> Vec<Frame> {
    let mut buffer = FrameBuffer::with_max_frame_len(max_frame_len);
    chunks.iter().flat_map(|chunk| buffer.push(chunk)).collect()
}

fn replies(actions: &[HandshakeAction]) -> usize {
    actions
        .iter()
        .filter(|a| {
            matches!(
                a,
                HandshakeAction::Send {
                    command: OutgoingCommand::HandshakeReply,
                    ..
                }
            )
        })
        .count()
}

#[test]
fn prop_frames_independent_of_chunking() {
    proptest!(|(data in wire_strategy(), points in prop::collection::vec(any::<Index>(), 0..16))| {
        let whole = frames_in_chunks(1024, &[data.clone()]);
        let chunked = frames_in_chunks(1024, &split_at_points(&data, &points));
        prop_assert_eq!(whole, chunked);
    });
}

#[test]
fn prop_oversized_lines_dropped_independent_of_chunking() {
    proptest!(|(data in wire_strategy(), points in prop::collection::vec(any::<Index>(), 0..16))| {
        let whole = frames_in_chunks(8, &[data.clone()]);
        let chunked = frames_in_chunks(8, &split_at_points(&data, &points));
        prop_assert!(whole.iter().all(|f| f.len() <= 8));
        prop_assert_eq!(whole, chunked);
    });
}

#[test]
fn prop_one_reply_per_rejection() {
    proptest!(|(failures in 0u32..20)| {
        let mut handshake = Handshake::default();
        let mut sent = replies(&handshake.on_frame(Frame::from("REQ_CHECK_1")));
        prop_assert_eq!(sent, 1);

        for _ in 0..failures {
            sent += replies(&handshake.on_frame(Frame::from("CONN_FAIL")));
        }
        let done = handshake.on_frame(Frame::from("CONN_PASS"));

        prop_assert_eq!(sent, 1 + failures as usize);
        prop_assert_eq!(handshake.state(), HandshakeState::Verified);
        prop_assert_eq!(done, vec![HandshakeAction::Emit(LinkEvent::Connected)]);
    });
}
