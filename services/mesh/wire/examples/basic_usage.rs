//! Basic usage example for the bulb wire protocol.

use bytes::BytesMut;
use mesh_wire::{
    ColorFrame, Command, Chunker, NetworkState, ProxyEnvelope, Reassembler, Response, Scene,
    SceneFrame, REPEAT_FOREVER,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Ilumi Wire Protocol Example ===\n");

    let mut state = NetworkState::new(0xC0FFEE11, 7);

    // 1. A simple acknowledged color command
    println!("1. Building SET_COLOR_NEED_RESP...");
    let (envelope, packet) =
        Command::SetColorNeedResp(ColorFrame::new(255, 80, 0, 0, 200)).build(&mut state)?;
    println!("   seq={} bytes={:02X?}", envelope.seq_num, packet.as_ref());
    println!("   next stored seq={}", state.seq_num);

    // 2. A scene large enough to need fragmenting
    println!("\n2. Fragmenting a two-frame scene...");
    let scene = Scene {
        scene_idx: 0,
        repeatable: REPEAT_FOREVER,
        start_now: true,
        frames: vec![
            SceneFrame::new(ColorFrame::new(255, 0, 0, 0, 255)),
            SceneFrame::new(ColorFrame::new(0, 0, 255, 0, 255)),
        ],
    };
    let (_, upload) = Command::SetColorPattern(scene).build(&mut state)?;
    let fragments = Chunker::split(&upload)?;
    println!("   {} bytes -> {} fragments", upload.len(), fragments.len());

    let mut reassembler = Reassembler::new();
    let mut restored = None;
    for fragment in fragments {
        restored = reassembler.push(fragment);
    }
    println!("   reassembled intact: {}", restored.as_deref() == Some(upload.as_ref()));

    // 3. Wrapping a query for a bulb behind the connected one
    println!("\n3. Proxying GET_BULB_COLOR...");
    let (_, inner) = Command::GetBulbColor.build(&mut state)?;
    let target = "A4:C1:38:00:11:22".parse()?;
    let proxy = ProxyEnvelope::new(target, inner);
    let mut body = BytesMut::new();
    proxy.encode(&mut body)?;
    println!("   ttl={} body={:02X?}", proxy.ttl(), body.as_ref());

    // 4. Decoding a notification
    println!("\n4. Decoding a color notification...");
    let reply = Response::decode(&[16, 0, 5, 0, 255, 128, 64, 0, 200])?;
    println!("   {:?}", reply);

    println!("\n=== Example completed successfully! ===");
    Ok(())
}
