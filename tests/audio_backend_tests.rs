// Unit tests for audio frames and the PCM codec
//
// These tests verify the wire representation of microphone and reply audio.

use base64::Engine;
use gemilive::audio::{
    decode_audio, decode_samples, encode_frame, AudioFrame, CaptureConstraints, OutputContext,
    VirtualOutput,
};
use gemilive::LiveError;

fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[test]
fn test_capture_constraints_default() {
    let constraints = CaptureConstraints::default();

    assert_eq!(constraints.sample_rate, 16000, "The live model expects 16kHz input");
    assert_eq!(constraints.channels, 1, "Default should be mono");
    assert_eq!(constraints.block_size, 4096);
    assert_eq!(constraints.block_duration().as_millis(), 256);
}

#[test]
fn test_audio_frame_from_f32_quantizes() {
    let frame = AudioFrame::from_f32(&[0.0, 0.5, -0.5, -1.0, 1.0], 16000);

    assert_eq!(frame.samples, vec![0, 16384, -16384, -32768, 32767]);
    assert_eq!(frame.channels, 1);
}

#[test]
fn test_audio_frame_odd_bytes_rejected() {
    assert!(AudioFrame::from_le_bytes(&[1, 2, 3], 24000, 1).is_none());
    assert!(AudioFrame::from_le_bytes(&[], 24000, 1).is_some());
}

#[test]
fn test_encoded_frame_is_little_endian_pcm() {
    let frame = encode_frame(&[0.5, -0.5]);

    assert_eq!(frame.mime_type, "audio/pcm;rate=16000");
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&frame.data)
        .unwrap();
    assert_eq!(bytes, vec![0x00, 0x40, 0x00, 0xC0]);
}

#[test]
fn test_encoded_frame_json_shape() {
    let json = serde_json::to_value(encode_frame(&[0.0])).unwrap();

    assert_eq!(json["mimeType"], "audio/pcm;rate=16000");
    assert_eq!(json["data"], "AAA=");
}

#[test]
fn test_decode_normalizes_samples() {
    let payload = b64(&[0x00, 0x40, 0x00, 0x80, 0xFF, 0x7F]);
    let samples = decode_samples(&payload).unwrap();

    assert_eq!(samples.len(), 3);
    assert_eq!(samples[0], 0.5);
    assert_eq!(samples[1], -1.0);
    assert!((samples[2] - 32767.0 / 32768.0).abs() < f32::EPSILON);
}

#[test]
fn test_decode_audio_builds_buffer_at_playback_rate() {
    let output = VirtualOutput::wall_clock(24000);
    let payload = b64(&vec![0u8; 24000 * 2]);

    let buffer = decode_audio(&payload, &output, 24000, 1).unwrap();

    assert_eq!(buffer.sample_rate(), 24000);
    assert_eq!(buffer.frames(), 24000);
    assert_eq!(buffer.duration(), 1.0);
    assert_eq!(output.sample_rate(), 24000);
}

#[test]
fn test_decode_audio_rejects_channel_mismatch() {
    let output = VirtualOutput::wall_clock(24000);
    // Three samples cannot be split into two channels
    let payload = b64(&[0u8; 6]);

    assert!(matches!(
        decode_audio(&payload, &output, 24000, 2),
        Err(LiveError::Decode { .. })
    ));
    assert!(decode_audio(&payload, &output, 24000, 0).is_err());
}
