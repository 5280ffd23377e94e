use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Generation mode. Selects the backend, worker pool, timeout and queue lane.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Mode {
    Image,
    Video,
    Audio,
    Web,
}

impl Mode {
    pub const ALL: [Mode; 4] = [Mode::Image, Mode::Video, Mode::Audio, Mode::Web];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Video and audio outputs have a length, so their requests must carry one.
    pub fn requires_duration(self) -> bool {
        matches!(self, Mode::Video | Mode::Audio)
    }

    /// Mime type assumed when a backend does not declare one.
    pub fn default_mime(self) -> &'static str {
        match self {
            Mode::Image => "image/png",
            Mode::Video => "video/mp4",
            Mode::Audio => "audio/mpeg",
            Mode::Web => "text/html",
        }
    }
}

/// Fixed lookup table with one slot per [`Mode`].
#[derive(Debug, Clone, PartialEq)]
pub struct ModeMap<T>([T; 4]);

impl<T> ModeMap<T> {
    pub fn new(image: T, video: T, audio: T, web: T) -> Self {
        Self([image, video, audio, web])
    }

    pub fn from_fn(f: impl FnMut(Mode) -> T) -> Self {
        Self(Mode::ALL.map(f))
    }

    pub fn get(&self, mode: Mode) -> &T {
        &self.0[mode.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (Mode, &T)> {
        Mode::ALL.into_iter().zip(self.0.iter())
    }
}
