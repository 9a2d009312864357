//! Binary layout of scene frames.
//!
//! All multi-byte fields are little-endian; floats are IEEE-754 `f32`.
//!
//! ```text
//! V1: version(1) frameId(8) timestamp(8) bodyCount(1) body*
//!     body  = bodyId(8) sourceCount(1) sourceId(1)* position(12) jointCount(1) joint*
//!     joint = jointType(1) confidence(4) position(12)
//!
//! V2: version(1) features(1) frameId(8) timestamp(8) bodyCount(1) body*
//!     body  = bodyId(8) sourceCount(1) sourceId(1)* position(12)
//!             [clippedEdges(1)]                          features bit 0
//!             [left: conf(4) state(1) right: conf(4) state(1)]  bit 1
//!             jointCount(1) joint* gestureCount(1) gesture*
//!     joint = jointType(1) confidence(4) position(12) [x y z w (16)]  bit 2
//!     gesture = tag(1) payload
//!     Walking (tag 1) = speed(12) flags(1)  bit 0 IsMoving, bit 1 IsWalking
//! ```

use std::io::{Cursor, Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt, LE};

use super::{
    BodyData, ClippedEdges, FrameError, FrameFeatures, FrameVersion, Gesture, GestureType,
    HandData, HandState, JointData, JointType, Quaternion, SceneFrame, Vector3,
};

/// Largest count a single-byte length prefix can carry.
pub const MAX_ENTRIES: usize = u8::MAX as usize;

const WALKING_IS_MOVING: u8 = 0x01;
const WALKING_IS_WALKING: u8 = 0x02;

const VECTOR3_LEN: usize = 12;
const QUATERNION_LEN: usize = 16;
const HAND_LEN: usize = 5;
const JOINT_LEN: usize = 1 + 4 + VECTOR3_LEN;
const WALKING_LEN: usize = 1 + VECTOR3_LEN + 1;

/// Encode a frame into a new buffer.
pub fn encode(frame: &SceneFrame) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(encoded_len(frame));
    encode_to(frame, &mut out)?;
    Ok(out)
}

/// Encode a frame into `writer`.
///
/// Every collection is checked against its length prefix before anything is
/// written, so an oversized frame leaves the writer untouched.
pub fn encode_to<W: Write>(frame: &SceneFrame, writer: &mut W) -> Result<(), FrameError> {
    check_counts(frame)?;

    let features = frame.effective_features();
    let v2 = frame.version == FrameVersion::V2;

    writer.write_u8(frame.version as u8)?;
    if v2 {
        writer.write_u8(features.to_byte())?;
    }
    writer.write_u64::<LE>(frame.frame_id)?;
    writer.write_i64::<LE>(frame.timestamp)?;
    writer.write_u8(frame.bodies.len() as u8)?;

    for body in &frame.bodies {
        write_body(writer, body, v2, features)?;
    }
    Ok(())
}

fn check_count(what: &'static str, count: usize) -> Result<(), FrameError> {
    if count > MAX_ENTRIES {
        return Err(FrameError::TooManyEntries { what, count });
    }
    Ok(())
}

fn check_counts(frame: &SceneFrame) -> Result<(), FrameError> {
    check_count("bodies", frame.bodies.len())?;
    for body in &frame.bodies {
        check_count("source ids", body.source_ids.len())?;
        check_count("joints", body.joints.len())?;
        if frame.version == FrameVersion::V2 {
            check_count("gestures", body.gestures.len())?;
        }
    }
    Ok(())
}

fn write_body<W: Write>(
    w: &mut W,
    body: &BodyData,
    v2: bool,
    features: FrameFeatures,
) -> Result<(), FrameError> {
    w.write_u64::<LE>(body.id)?;
    w.write_u8(body.source_ids.len() as u8)?;
    w.write_all(&body.source_ids)?;
    write_vector3(w, body.position)?;

    if features.clipped_edges {
        w.write_u8(body.clipped_edges.unwrap_or_default().0)?;
    }
    if features.hand_tracking {
        write_hand(w, body.left_hand.unwrap_or_default())?;
        write_hand(w, body.right_hand.unwrap_or_default())?;
    }

    w.write_u8(body.joints.len() as u8)?;
    for (joint_type, joint) in &body.joints {
        w.write_u8(*joint_type as u8)?;
        w.write_f32::<LE>(joint.confidence)?;
        write_vector3(w, joint.position)?;
        if features.joint_rotation {
            let q = joint.orientation.unwrap_or_default();
            w.write_f32::<LE>(q.x)?;
            w.write_f32::<LE>(q.y)?;
            w.write_f32::<LE>(q.z)?;
            w.write_f32::<LE>(q.w)?;
        }
    }

    if v2 {
        w.write_u8(body.gestures.len() as u8)?;
        for gesture in body.gestures.values() {
            write_gesture(w, gesture)?;
        }
    }
    Ok(())
}

fn write_vector3<W: Write>(w: &mut W, v: Vector3) -> Result<(), FrameError> {
    w.write_f32::<LE>(v.x)?;
    w.write_f32::<LE>(v.y)?;
    w.write_f32::<LE>(v.z)?;
    Ok(())
}

fn write_hand<W: Write>(w: &mut W, hand: HandData) -> Result<(), FrameError> {
    w.write_f32::<LE>(hand.confidence)?;
    w.write_u8(hand.state as u8)?;
    Ok(())
}

fn write_gesture<W: Write>(w: &mut W, gesture: &Gesture) -> Result<(), FrameError> {
    w.write_u8(gesture.gesture_type() as u8)?;
    match gesture {
        Gesture::Walking {
            estimated_walk_speed,
            is_walking,
            is_moving,
        } => {
            write_vector3(w, *estimated_walk_speed)?;
            let mut flags = 0;
            if *is_moving {
                flags |= WALKING_IS_MOVING;
            }
            if *is_walking {
                flags |= WALKING_IS_WALKING;
            }
            w.write_u8(flags)?;
        }
    }
    Ok(())
}

/// Exact encoded size of `frame`.
pub fn encoded_len(frame: &SceneFrame) -> usize {
    let features = frame.effective_features();
    let v2 = frame.version == FrameVersion::V2;

    let header = 1 + usize::from(v2) + 8 + 8 + 1;
    let joint_len = JOINT_LEN + if features.joint_rotation { QUATERNION_LEN } else { 0 };

    let bodies: usize = frame
        .bodies
        .iter()
        .map(|body| {
            let mut len = 8 + 1 + body.source_ids.len() + VECTOR3_LEN;
            if features.clipped_edges {
                len += 1;
            }
            if features.hand_tracking {
                len += 2 * HAND_LEN;
            }
            len += 1 + body.joints.len() * joint_len;
            if v2 {
                len += 1 + body.gestures.len() * WALKING_LEN;
            }
            len
        })
        .sum();

    header + bodies
}

/// Decode one frame occupying all of `bytes`.
pub fn decode(bytes: &[u8]) -> Result<SceneFrame, FrameError> {
    let mut r = Reader::new(bytes);

    let version = FrameVersion::try_from(r.u8()?)?;
    let v2 = version == FrameVersion::V2;
    let features = if v2 {
        FrameFeatures::from_byte(r.u8()?)
    } else {
        FrameFeatures::default()
    };
    let frame_id = r.u64()?;
    let timestamp = r.i64()?;

    let body_count = r.u8()?;
    let mut bodies = Vec::with_capacity(usize::from(body_count));
    for _ in 0..body_count {
        bodies.push(read_body(&mut r, v2, features)?);
    }

    let trailing = r.remaining();
    if trailing > 0 {
        return Err(FrameError::TrailingBytes(trailing));
    }

    Ok(SceneFrame {
        version,
        frame_id,
        timestamp,
        features,
        bodies,
    })
}

fn read_body(r: &mut Reader<'_>, v2: bool, features: FrameFeatures) -> Result<BodyData, FrameError> {
    let id = r.u64()?;
    let source_count = r.u8()?;
    let source_ids = r.bytes(usize::from(source_count))?;
    let position = r.vector3()?;

    let clipped_edges = if features.clipped_edges {
        Some(ClippedEdges(r.u8()?))
    } else {
        None
    };
    let (left_hand, right_hand) = if features.hand_tracking {
        (Some(r.hand()?), Some(r.hand()?))
    } else {
        (None, None)
    };

    let mut body = BodyData {
        id,
        position,
        source_ids,
        left_hand,
        right_hand,
        clipped_edges,
        ..BodyData::default()
    };

    let joint_count = r.u8()?;
    for _ in 0..joint_count {
        let joint_type = JointType::try_from(r.u8()?)?;
        let confidence = r.f32()?;
        let position = r.vector3()?;
        let orientation = if features.joint_rotation {
            Some(Quaternion::new(r.f32()?, r.f32()?, r.f32()?, r.f32()?))
        } else {
            None
        };
        body.joints.insert(
            joint_type,
            JointData {
                joint_type,
                confidence,
                position,
                orientation,
            },
        );
    }

    if v2 {
        let gesture_count = r.u8()?;
        for _ in 0..gesture_count {
            let gesture = match GestureType::try_from(r.u8()?)? {
                GestureType::Walking => {
                    let estimated_walk_speed = r.vector3()?;
                    let flags = r.u8()?;
                    Gesture::Walking {
                        estimated_walk_speed,
                        is_walking: flags & WALKING_IS_WALKING != 0,
                        is_moving: flags & WALKING_IS_MOVING != 0,
                    }
                }
            };
            body.insert_gesture(gesture);
        }
    }

    Ok(body)
}

/// Cursor that reports a short read as [`FrameError::Truncated`].
struct Reader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(bytes),
        }
    }

    fn remaining(&self) -> usize {
        let len = self.cursor.get_ref().len() as u64;
        len.saturating_sub(self.cursor.position()) as usize
    }

    fn u8(&mut self) -> Result<u8, FrameError> {
        self.cursor.read_u8().map_err(|_| FrameError::Truncated)
    }

    fn u64(&mut self) -> Result<u64, FrameError> {
        self.cursor.read_u64::<LE>().map_err(|_| FrameError::Truncated)
    }

    fn i64(&mut self) -> Result<i64, FrameError> {
        self.cursor.read_i64::<LE>().map_err(|_| FrameError::Truncated)
    }

    fn f32(&mut self) -> Result<f32, FrameError> {
        self.cursor.read_f32::<LE>().map_err(|_| FrameError::Truncated)
    }

    fn bytes(&mut self, len: usize) -> Result<Vec<u8>, FrameError> {
        let mut buf = vec![0u8; len];
        self.cursor
            .read_exact(&mut buf)
            .map_err(|_| FrameError::Truncated)?;
        Ok(buf)
    }

    fn vector3(&mut self) -> Result<Vector3, FrameError> {
        Ok(Vector3::new(self.f32()?, self.f32()?, self.f32()?))
    }

    fn hand(&mut self) -> Result<HandData, FrameError> {
        let confidence = self.f32()?;
        let state = HandState::try_from(self.u8()?)?;
        Ok(HandData { confidence, state })
    }
}
