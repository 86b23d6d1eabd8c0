use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable track identifier as advertised in WebRTC SDP. Maps deterministically
/// to a robot resource short name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamName(String);

impl StreamName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StreamName {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Identifies one peer connection holding zero or more stream subscriptions.
/// Assigned by the surrounding gRPC/WebRTC service when a peer connects;
/// the registry only ever treats it as an opaque map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(Uuid);

impl PeerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// What the registry needs to create a stream's backing `StreamState`
/// (§4.2 `new_stream`). `camera_name` is the robot resource short name the
/// stream's source adapters are looked up by; it is also the key
/// `add_new_streams` and the camera monitor use to decide whether a stream
/// still has a camera behind it.
#[derive(Debug, Clone)]
pub struct NewStreamConfig {
    pub name: StreamName,
    pub camera_name: String,
    /// RTP payload type advertised on the `TrackLocalStaticRTP`'s codec
    /// capability. Both source modes must agree with whatever the
    /// encoded pipeline and passthrough camera actually emit.
    pub payload_type: u8,
}

/// Identifies an open passthrough subscription with a camera. Opaque to
/// callers; only the adapter that issued it can meaningfully compare it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl SubscriptionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A width/height pair. Both dimensions are tracked together so that
/// "even on both axes" invariants stay a property of the type rather than
/// something every call site has to re-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_even(&self) -> bool {
        self.width % 2 == 0 && self.height % 2 == 0
    }

    pub fn is_positive(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// Crop down by one pixel on each odd axis so the result is even on
    /// both axes, per the encoder's requirement. A no-op if already even.
    pub fn crop_to_even(&self) -> Resolution {
        Resolution::new(
            self.width - (self.width % 2),
            self.height - (self.height % 2),
        )
    }

    /// Halve both dimensions, rounding down.
    fn halved(&self) -> Resolution {
        Resolution::new(self.width / 2, self.height / 2)
    }

    /// The native resolution plus up to four progressively halved,
    /// even-integer down-scalings (stopping once a further halving would
    /// drop below 2 on either axis).
    pub fn scaled_options(&self) -> Vec<Resolution> {
        let mut options = vec![*self];
        let mut current = *self;
        for _ in 0..4 {
            let next = current.halved();
            if next.width < 2 || next.height < 2 || !next.is_even() {
                break;
            }
            options.push(next);
            current = next;
        }
        options
    }
}

/// Image encodings a camera may hand back when asked for its current
/// images, in the priority order the encoded-mode frame reader selects from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageMime {
    Jpeg,
    Png,
    RawRgba,
    RawDepth,
    Qoi,
}

/// Fixed priority order for streamable image selection (§6).
pub const IMAGE_MIME_PRIORITY: [ImageMime; 5] = [
    ImageMime::Jpeg,
    ImageMime::Png,
    ImageMime::RawRgba,
    ImageMime::RawDepth,
    ImageMime::Qoi,
];

impl ImageMime {
    /// Lower rank sorts first. Used to pick the best available source
    /// among the MIME types a camera currently offers.
    pub fn priority_rank(&self) -> usize {
        IMAGE_MIME_PRIORITY
            .iter()
            .position(|m| m == self)
            .expect("ImageMime variant missing from IMAGE_MIME_PRIORITY")
    }
}

/// Picks the best image, by MIME priority, out of the camera's currently
/// offered sources. Returns the chosen source's name and MIME.
pub fn select_streamable_image<'a>(
    offered: &'a [(String, ImageMime)],
) -> Option<&'a (String, ImageMime)> {
    offered.iter().min_by_key(|(_, mime)| mime.priority_rank())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaled_options_stop_below_two() {
        let native = Resolution::new(32, 24);
        let options = native.scaled_options();
        // 32x24 -> 16x12 -> 8x6 -> 4x3 (odd height, stop) since 3 is not even.
        assert_eq!(options[0], Resolution::new(32, 24));
        assert!(options.iter().all(|r| r.is_even()));
        assert!(options.last().unwrap().width >= 2 && options.last().unwrap().height >= 2);
    }

    #[test]
    fn scaled_options_caps_at_four_extra() {
        let native = Resolution::new(4096, 4096);
        let options = native.scaled_options();
        assert_eq!(options.len(), 5); // native + 4 halvings
        assert_eq!(options[4], Resolution::new(256, 256));
    }

    #[test]
    fn crop_to_even_trims_odd_axes() {
        let cropped = Resolution::new(641, 480).crop_to_even();
        assert_eq!(cropped, Resolution::new(640, 480));
    }

    #[test]
    fn select_streamable_image_prefers_jpeg_over_png() {
        let offered = vec![
            ("color".to_string(), ImageMime::Png),
            ("color".to_string(), ImageMime::Jpeg),
        ];
        let chosen = select_streamable_image(&offered).unwrap();
        assert_eq!(chosen.1, ImageMime::Jpeg);
    }
}
