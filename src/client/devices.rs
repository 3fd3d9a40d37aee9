//! File-backed stand-ins for the microphone and the speaker, used by the headless client.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::Cursor;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use super::capture::{CaptureError, MediaCapture};
use super::playback::{AudioOutput, PlaybackError};

/// Replays a recorded file as if it were being captured live, one segment per request.
pub struct FileCapture {
    path: PathBuf,
    segment_bytes: usize,
    file: Option<File>,
}

impl FileCapture {
    pub fn new(path: impl Into<PathBuf>, segment_bytes: usize) -> Self {
        Self {
            path: path.into(),
            segment_bytes: segment_bytes.max(1),
            file: None,
        }
    }
}

#[async_trait]
impl MediaCapture for FileCapture {
    async fn acquire(&mut self) -> Result<(), CaptureError> {
        let describe = |e: std::io::Error| format!("{}: {}", self.path.display(), e);
        let file = File::open(&self.path)
            .await
            .map_err(|e| CaptureError::Acquisition(describe(e)))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| CaptureError::Acquisition(describe(e)))?
            .len();
        if size == 0 {
            return Err(CaptureError::Acquisition(format!(
                "{}: input is empty",
                self.path.display()
            )));
        }
        info!(path = %self.path.display(), bytes = size, "Opened capture input");
        self.file = Some(file);
        Ok(())
    }

    async fn request_data(&mut self) -> Result<Option<Vec<u8>>, CaptureError> {
        let Some(file) = self.file.as_mut() else {
            return Ok(None);
        };
        let mut segment = vec![0u8; self.segment_bytes];
        let mut filled = 0;
        while filled < segment.len() {
            let read = file.read(&mut segment[filled..]).await?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        if filled == 0 {
            self.file = None;
            return Ok(None);
        }
        segment.truncate(filled);
        Ok(Some(segment))
    }

    fn stop(&mut self) {
        self.file = None;
    }
}

#[derive(Debug)]
pub struct DecodedClip {
    pub duration: Duration,
    pub channels: u16,
    pub sample_rate: u32,
    raw: Bytes,
}

/// Decodes WAV replies, optionally writes them out, and holds each one for its real duration.
pub struct PacedWavOutput {
    output_dir: Option<PathBuf>,
    clips_written: usize,
}

impl PacedWavOutput {
    pub fn new(output_dir: Option<PathBuf>) -> Self {
        Self {
            output_dir,
            clips_written: 0,
        }
    }
}

fn decode_wav(audio: &Bytes) -> Result<DecodedClip, PlaybackError> {
    let (header, data) =
        wav::read(&mut Cursor::new(&audio[..])).map_err(|e| PlaybackError::Decode(e.to_string()))?;

    if header.channel_count == 0 || header.sampling_rate == 0 {
        return Err(PlaybackError::Decode("invalid WAV header".to_string()));
    }

    let samples = match &data {
        wav::BitDepth::Eight(s) => s.len(),
        wav::BitDepth::Sixteen(s) => s.len(),
        wav::BitDepth::TwentyFour(s) => s.len(),
        wav::BitDepth::ThirtyTwoFloat(s) => s.len(),
        wav::BitDepth::Empty => return Err(PlaybackError::Decode("no samples".to_string())),
    };
    let frames = samples as f64 / header.channel_count as f64;

    Ok(DecodedClip {
        duration: Duration::from_secs_f64(frames / header.sampling_rate as f64),
        channels: header.channel_count,
        sample_rate: header.sampling_rate,
        raw: audio.clone(),
    })
}

#[async_trait]
impl AudioOutput for PacedWavOutput {
    type Clip = DecodedClip;

    async fn decode(&mut self, audio: Bytes) -> Result<DecodedClip, PlaybackError> {
        decode_wav(&audio)
    }

    async fn play(&mut self, clip: DecodedClip) -> Result<(), PlaybackError> {
        if let Some(dir) = &self.output_dir {
            self.clips_written += 1;
            let path = dir.join(format!("reply-{:04}.wav", self.clips_written));
            tokio::fs::write(&path, &clip.raw)
                .await
                .map_err(|e| PlaybackError::Output(format!("{}: {}", path.display(), e)))?;
            debug!(path = %path.display(), "Wrote reply clip");
        }

        info!(
            duration_ms = clip.duration.as_millis() as u64,
            channels = clip.channels,
            sample_rate = clip.sample_rate,
            "Playing reply clip"
        );
        tokio::time::sleep(clip.duration).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_bytes(samples: Vec<i16>, sample_rate: u32, channels: u16) -> Bytes {
        let header = wav::Header::new(wav::WAV_FORMAT_PCM, channels, sample_rate, 16);
        let mut out = Cursor::new(Vec::new());
        wav::write(header, &wav::BitDepth::Sixteen(samples), &mut out).unwrap();
        Bytes::from(out.into_inner())
    }

    #[test]
    fn test_decode_wav_duration() {
        let clip = decode_wav(&wav_bytes(vec![0; 24_000], 24_000, 1)).unwrap();
        assert_eq!(clip.duration, Duration::from_secs(1));
        assert_eq!(clip.sample_rate, 24_000);

        let stereo = decode_wav(&wav_bytes(vec![0; 16_000], 16_000, 2)).unwrap();
        assert_eq!(stereo.duration, Duration::from_millis(500));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode_wav(&Bytes::from_static(b"definitely not a wav file")).unwrap_err();
        assert!(matches!(err, PlaybackError::Decode(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_holds_for_clip_duration() {
        let dir = std::env::temp_dir().join(format!("voice-relay-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let mut output = PacedWavOutput::new(Some(dir.clone()));
        let clip = output.decode(wav_bytes(vec![0; 8_000], 16_000, 1)).await.unwrap();
        let start = tokio::time::Instant::now();
        output.play(clip).await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_millis(500));
        assert!(dir.join("reply-0001.wav").exists());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_file_capture_segments() {
        let path = std::env::temp_dir().join(format!("voice-relay-{}.webm", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, vec![9u8; 10]).await.unwrap();

        let mut capture = FileCapture::new(&path, 4);
        capture.acquire().await.unwrap();
        let mut sizes = Vec::new();
        while let Some(segment) = capture.request_data().await.unwrap() {
            sizes.push(segment.len());
        }
        assert_eq!(sizes, vec![4, 4, 2]);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_missing_file_is_acquisition_failure() {
        let mut capture = FileCapture::new("/nonexistent/voice-relay-input.webm", 4);
        assert!(matches!(
            capture.acquire().await,
            Err(CaptureError::Acquisition(_))
        ));
    }
}
