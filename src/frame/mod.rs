//! Scene frames: versioned snapshots of tracked bodies.
//!
//! A [`SceneFrame`] is what a Data Source streams to a Tracking Service on the
//! data plane. The byte layout is fixed per [`FrameVersion`]; version 2 adds a
//! feature byte whose bits gate the optional sections (see [`codec`]).

pub mod codec;
mod error;

use std::collections::BTreeMap;

pub use codec::{decode, encode, encode_to};
pub use error::FrameError;

/// Wire layout version, written as byte 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum FrameVersion {
    V1 = 1,
    #[default]
    V2 = 2,
}

impl TryFrom<u8> for FrameVersion {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FrameVersion::V1),
            2 => Ok(FrameVersion::V2),
            other => Err(FrameError::UnknownVersion(other)),
        }
    }
}

/// Optional sections enabled in a version-2 frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FrameFeatures {
    /// Per-body clipped-edges byte (bit 0).
    pub clipped_edges: bool,
    /// Left and right hand blocks (bit 1).
    pub hand_tracking: bool,
    /// Orientation quaternion on every joint (bit 2).
    pub joint_rotation: bool,
}

impl FrameFeatures {
    pub const CLIPPED_EDGES: u8 = 0x01;
    pub const HAND_TRACKING: u8 = 0x02;
    pub const JOINT_ROTATION: u8 = 0x04;

    /// Every optional section enabled.
    pub fn all() -> Self {
        Self {
            clipped_edges: true,
            hand_tracking: true,
            joint_rotation: true,
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut bits = 0;
        if self.clipped_edges {
            bits |= Self::CLIPPED_EDGES;
        }
        if self.hand_tracking {
            bits |= Self::HAND_TRACKING;
        }
        if self.joint_rotation {
            bits |= Self::JOINT_ROTATION;
        }
        bits
    }

    /// Unknown bits are ignored.
    pub fn from_byte(bits: u8) -> Self {
        Self {
            clipped_edges: bits & Self::CLIPPED_EDGES != 0,
            hand_tracking: bits & Self::HAND_TRACKING != 0,
            joint_rotation: bits & Self::JOINT_ROTATION != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vector3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Quaternion {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Quaternion {
    pub const IDENTITY: Quaternion = Quaternion::new(0.0, 0.0, 0.0, 1.0);

    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }
}

/// Skeleton joints, numbered as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum JointType {
    #[default]
    SpineBase = 0,
    SpineMid = 1,
    Neck = 2,
    Head = 3,
    ShoulderLeft = 4,
    ElbowLeft = 5,
    WristLeft = 6,
    HandLeft = 7,
    ShoulderRight = 8,
    ElbowRight = 9,
    WristRight = 10,
    HandRight = 11,
    HipLeft = 12,
    KneeLeft = 13,
    AnkleLeft = 14,
    FootLeft = 15,
    HipRight = 16,
    KneeRight = 17,
    AnkleRight = 18,
    FootRight = 19,
    SpineShoulder = 20,
    HandTipLeft = 21,
    ThumbLeft = 22,
    HandTipRight = 23,
    ThumbRight = 24,
}

impl JointType {
    pub const ALL: [JointType; 25] = [
        JointType::SpineBase,
        JointType::SpineMid,
        JointType::Neck,
        JointType::Head,
        JointType::ShoulderLeft,
        JointType::ElbowLeft,
        JointType::WristLeft,
        JointType::HandLeft,
        JointType::ShoulderRight,
        JointType::ElbowRight,
        JointType::WristRight,
        JointType::HandRight,
        JointType::HipLeft,
        JointType::KneeLeft,
        JointType::AnkleLeft,
        JointType::FootLeft,
        JointType::HipRight,
        JointType::KneeRight,
        JointType::AnkleRight,
        JointType::FootRight,
        JointType::SpineShoulder,
        JointType::HandTipLeft,
        JointType::ThumbLeft,
        JointType::HandTipRight,
        JointType::ThumbRight,
    ];
}

impl TryFrom<u8> for JointType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        JointType::ALL
            .get(usize::from(value))
            .copied()
            .ok_or(FrameError::UnknownJointType(value))
    }
}

/// Tracking state of a hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum HandState {
    #[default]
    Unknown = 0,
    NotTracked = 1,
    Open = 2,
    Closed = 3,
    Lasso = 4,
}

impl TryFrom<u8> for HandState {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(HandState::Unknown),
            1 => Ok(HandState::NotTracked),
            2 => Ok(HandState::Open),
            3 => Ok(HandState::Closed),
            4 => Ok(HandState::Lasso),
            other => Err(FrameError::UnknownHandState(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HandData {
    pub confidence: f32,
    pub state: HandState,
}

/// Frame edges a body extends beyond, as a bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ClippedEdges(pub u8);

impl ClippedEdges {
    pub const NONE: u8 = 0x00;
    pub const RIGHT: u8 = 0x01;
    pub const LEFT: u8 = 0x02;
    pub const TOP: u8 = 0x04;
    pub const BOTTOM: u8 = 0x08;

    pub fn contains(self, edge: u8) -> bool {
        self.0 & edge == edge
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct JointData {
    pub joint_type: JointType,
    pub confidence: f32,
    pub position: Vector3,
    /// Present only when the frame carries joint rotations.
    pub orientation: Option<Quaternion>,
}

impl JointData {
    pub fn new(joint_type: JointType, confidence: f32, position: Vector3) -> Self {
        Self {
            joint_type,
            confidence,
            position,
            orientation: None,
        }
    }

    pub fn with_orientation(mut self, orientation: Quaternion) -> Self {
        self.orientation = Some(orientation);
        self
    }
}

/// Gesture wire tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum GestureType {
    Walking = 1,
}

impl TryFrom<u8> for GestureType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(GestureType::Walking),
            other => Err(FrameError::UnknownGesture(other)),
        }
    }
}

/// A recognized gesture with its type-specific payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Gesture {
    Walking {
        estimated_walk_speed: Vector3,
        is_walking: bool,
        is_moving: bool,
    },
}

impl Gesture {
    pub fn gesture_type(&self) -> GestureType {
        match self {
            Gesture::Walking { .. } => GestureType::Walking,
        }
    }
}

/// One tracked body.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BodyData {
    pub id: u64,
    pub position: Vector3,
    /// Data Sources that contributed to this body.
    pub source_ids: Vec<u8>,
    pub joints: BTreeMap<JointType, JointData>,
    /// Version 2 only.
    pub gestures: BTreeMap<GestureType, Gesture>,
    pub left_hand: Option<HandData>,
    pub right_hand: Option<HandData>,
    pub clipped_edges: Option<ClippedEdges>,
}

impl BodyData {
    pub fn new(id: u64, position: Vector3) -> Self {
        Self {
            id,
            position,
            ..Self::default()
        }
    }

    /// Insert a joint keyed by its own type.
    pub fn insert_joint(&mut self, joint: JointData) {
        self.joints.insert(joint.joint_type, joint);
    }

    /// Insert a gesture keyed by its own type.
    pub fn insert_gesture(&mut self, gesture: Gesture) {
        self.gestures.insert(gesture.gesture_type(), gesture);
    }
}

/// A snapshot of every tracked body at one instant.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SceneFrame {
    pub version: FrameVersion,
    pub frame_id: u64,
    /// Capture time in 100 ns ticks.
    pub timestamp: i64,
    /// Ignored by version 1.
    pub features: FrameFeatures,
    pub bodies: Vec<BodyData>,
}

impl SceneFrame {
    pub fn new(version: FrameVersion, frame_id: u64, timestamp: i64) -> Self {
        Self {
            version,
            frame_id,
            timestamp,
            features: FrameFeatures::default(),
            bodies: Vec::new(),
        }
    }

    pub fn with_features(mut self, features: FrameFeatures) -> Self {
        self.features = features;
        self
    }

    /// Features that actually reach the wire for this frame's version.
    pub fn effective_features(&self) -> FrameFeatures {
        match self.version {
            FrameVersion::V1 => FrameFeatures::default(),
            FrameVersion::V2 => self.features,
        }
    }

    /// The frame as a decoder would reproduce it.
    ///
    /// Sections gated off by the version or feature byte are cleared; sections
    /// gated on but left empty are filled with the zero value the encoder
    /// writes for them.
    pub fn normalized(&self) -> SceneFrame {
        let features = self.effective_features();
        let v2 = self.version == FrameVersion::V2;
        let mut frame = self.clone();
        frame.features = features;

        for body in &mut frame.bodies {
            body.clipped_edges = features
                .clipped_edges
                .then(|| body.clipped_edges.unwrap_or_default());
            if features.hand_tracking {
                body.left_hand = Some(body.left_hand.unwrap_or_default());
                body.right_hand = Some(body.right_hand.unwrap_or_default());
            } else {
                body.left_hand = None;
                body.right_hand = None;
            }
            for (joint_type, joint) in body.joints.iter_mut() {
                joint.joint_type = *joint_type;
                joint.orientation = features
                    .joint_rotation
                    .then(|| joint.orientation.unwrap_or_default());
            }
            if !v2 {
                body.gestures.clear();
            }
        }
        frame
    }

    /// Exact size of the encoded frame in bytes.
    pub fn encoded_len(&self) -> usize {
        codec::encoded_len(self)
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        codec::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<SceneFrame, FrameError> {
        codec::decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_byte() {
        let features = FrameFeatures {
            clipped_edges: true,
            hand_tracking: false,
            joint_rotation: true,
        };
        assert_eq!(features.to_byte(), 0b101);
        assert_eq!(FrameFeatures::from_byte(0b1111_0101), features);
        assert_eq!(FrameFeatures::all().to_byte(), 0b111);
    }

    #[test]
    fn test_wire_enums_reject_unknown_values() {
        assert_eq!(JointType::try_from(24).unwrap(), JointType::ThumbRight);
        assert!(matches!(
            JointType::try_from(25),
            Err(FrameError::UnknownJointType(25))
        ));
        assert!(matches!(
            HandState::try_from(5),
            Err(FrameError::UnknownHandState(5))
        ));
        assert!(matches!(
            GestureType::try_from(0),
            Err(FrameError::UnknownGesture(0))
        ));
        assert!(matches!(
            FrameVersion::try_from(3),
            Err(FrameError::UnknownVersion(3))
        ));
    }

    #[test]
    fn test_normalized_v1_drops_v2_sections() {
        let mut body = BodyData::new(7, Vector3::new(1.0, 2.0, 3.0));
        body.insert_joint(
            JointData::new(JointType::Head, 0.9, Vector3::default())
                .with_orientation(Quaternion::IDENTITY),
        );
        body.insert_gesture(Gesture::Walking {
            estimated_walk_speed: Vector3::new(0.5, 0.0, 0.0),
            is_walking: true,
            is_moving: true,
        });
        body.left_hand = Some(HandData::default());
        body.clipped_edges = Some(ClippedEdges(ClippedEdges::TOP));

        let mut frame = SceneFrame::new(FrameVersion::V1, 1, 2).with_features(FrameFeatures::all());
        frame.bodies.push(body);

        let normalized = frame.normalized();
        let body = &normalized.bodies[0];
        assert_eq!(normalized.features, FrameFeatures::default());
        assert!(body.gestures.is_empty());
        assert!(body.left_hand.is_none());
        assert!(body.clipped_edges.is_none());
        assert!(body.joints[&JointType::Head].orientation.is_none());
    }

    #[test]
    fn test_normalized_fills_enabled_sections() {
        let mut body = BodyData::new(7, Vector3::default());
        body.insert_joint(JointData::new(JointType::Neck, 1.0, Vector3::default()));
        let mut frame = SceneFrame::new(FrameVersion::V2, 1, 2).with_features(FrameFeatures::all());
        frame.bodies.push(body);

        let body = &frame.normalized().bodies[0];
        assert_eq!(body.clipped_edges, Some(ClippedEdges(0)));
        assert_eq!(body.right_hand, Some(HandData::default()));
        assert_eq!(
            body.joints[&JointType::Neck].orientation,
            Some(Quaternion::default())
        );
    }
}
