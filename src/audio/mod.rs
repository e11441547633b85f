pub mod backend;
pub mod codec;
pub mod file;
pub mod output;

#[cfg(feature = "cpal-audio")]
pub mod cpal_device;

pub use backend::{
    AudioBackendFactory, AudioFrame, AudioSource, CaptureConstraints, DeviceGuard, DeviceHandle,
    MicrophoneSource, MicrophoneStream,
};
pub use codec::{
    decode_audio, decode_samples, encode_audio_frame, encode_frame, encode_frame_at, EncodedFrame,
    CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE,
};
pub use file::{AudioFile, FileMicrophone};
pub use output::{
    ManualClock, OutputContext, OutputFactory, PcmBuffer, PlaybackLog, PlaybackRecord,
    SourceHandle, VirtualOutput, VirtualOutputFactory, WALL_CLOCK_LOG_LIMIT,
};
