// Format negotiation for PipeWire streams
//
// Proposals are described as plain data first so the negotiation order can be
// checked without a PipeWire daemon; `pod` turns them into SPA pods.

use crate::config::CandidateFormat;
use crate::frame::{BufferKind, FormatDescriptor, PixelFormat};

/// Oldest libpipewire that negotiates dma-buf modifiers correctly
pub const DMABUF_MIN_VERSION: (u32, u32, u32) = (0, 3, 33);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rectangle {
    pub width: u32,
    pub height: u32,
}

impl Rectangle {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Size range offered in a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeRange {
    pub default: Rectangle,
    pub min: Rectangle,
    pub max: Rectangle,
}

/// Framerate range offered in a proposal, all fractions over 1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramerateRange {
    pub default: u32,
    pub min: u32,
    pub max: u32,
}

/// Modifier enumeration attached to a proposal
///
/// Sent with the mandatory and don't-fixate flags so the producer has to pick
/// one of them and can still renegotiate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifierChoice {
    pub preferred: u64,
    pub alternatives: Vec<u64>,
}

/// One `EnumFormat` entry offered to the producer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatProposal {
    /// SPA video format ids; more than one means an enumeration
    pub formats: Vec<u32>,
    pub modifier: Option<ModifierChoice>,
    pub size: SizeRange,
    pub framerate: FramerateRange,
}

impl FormatProposal {
    /// Proposal for a GPU-importable candidate, `None` without modifiers
    pub fn for_candidate(candidate: &CandidateFormat, fps: u32) -> Option<Self> {
        let preferred = candidate.preferred_modifier()?;
        Some(Self {
            formats: vec![candidate.format],
            modifier: Some(ModifierChoice {
                preferred,
                alternatives: candidate.modifiers.clone(),
            }),
            size: SizeRange {
                default: Rectangle::new(320, 240),
                min: Rectangle::new(1, 1),
                max: Rectangle::new(8192, 4320),
            },
            framerate: FramerateRange {
                default: fps,
                min: 0,
                max: 360,
            },
        })
    }

    /// Generic memory proposal accepted by every producer
    pub fn fallback(fps: u32) -> Self {
        Self {
            formats: PixelFormat::FALLBACK.iter().map(|f| f.as_spa()).collect(),
            modifier: None,
            size: SizeRange {
                default: Rectangle::new(320, 240),
                min: Rectangle::new(1, 1),
                max: Rectangle::new(8192, 8192),
            },
            framerate: FramerateRange {
                default: fps,
                min: 0,
                max: crate::config::MAX_FPS,
            },
        }
    }
}

/// All proposals for a stream, in priority order
///
/// One per candidate that declares at least one modifier, then the generic
/// fallback. The fallback is appended even when modifier proposals exist.
pub fn build_proposals(fps: u32, candidates: &[CandidateFormat]) -> Vec<FormatProposal> {
    candidates
        .iter()
        .filter_map(|c| FormatProposal::for_candidate(c, fps))
        .chain(std::iter::once(FormatProposal::fallback(fps)))
        .collect()
}

/// Buffer data types to accept once `format` is negotiated
pub fn accepted_buffer_kinds(format: &FormatDescriptor, dmabuf_requested: bool) -> u32 {
    let mut mask = BufferKind::MemPtr.mask() | BufferKind::MemFd.mask();
    if format.modifier.is_some() || dmabuf_requested {
        mask |= BufferKind::DmaBuf.mask();
    }
    mask
}

/// Parse a `major.minor.micro` library version
pub fn parse_version(version: &str) -> Option<(u32, u32, u32)> {
    let mut parts = version.trim().split('.').map(|p| p.parse::<u32>().ok());
    let major = parts.next()??;
    let minor = parts.next().flatten().unwrap_or(0);
    let micro = parts.next().flatten().unwrap_or(0);
    Some((major, minor, micro))
}

/// Whether a libpipewire of this version can negotiate dma-buf modifiers
pub fn dmabuf_negotiation_supported(version: &str) -> bool {
    parse_version(version)
        .map(|v| v >= DMABUF_MIN_VERSION)
        .unwrap_or(false)
}

/// Human readable name of an SPA video format id, for logs
pub fn format_name(format: u32) -> String {
    match PixelFormat::from_spa(format) {
        Some(known) => known.to_string(),
        None => format!("format #{}", format),
    }
}

#[cfg(feature = "pipewire")]
pub(crate) mod pod {
    use super::{FormatProposal, FramerateRange, SizeRange};
    use crate::capture::CaptureBackendError;
    use crate::frame::{FormatDescriptor, Framerate};
    use pipewire::spa;
    use spa::param::format::{FormatProperties, MediaSubtype, MediaType};
    use spa::param::video::VideoInfoRaw;
    use spa::param::ParamType;
    use spa::pod::serialize::PodSerializer;
    use spa::pod::{ChoiceValue, Object, Pod, Property, PropertyFlags, Value};
    use spa::utils::{Choice, ChoiceEnum, ChoiceFlags, Fraction, Id, SpaTypes};

    fn serialize(value: Value) -> Result<Vec<u8>, CaptureBackendError> {
        PodSerializer::serialize(std::io::Cursor::new(Vec::new()), &value)
            .map(|(cursor, _)| cursor.into_inner())
            .map_err(|e| {
                CaptureBackendError::Negotiation(format!("Failed to serialize pod: {:?}", e))
            })
    }

    fn id_property(key: FormatProperties, id: u32) -> Property {
        Property {
            key: key.as_raw(),
            flags: PropertyFlags::empty(),
            value: Value::Id(Id(id)),
        }
    }

    fn size_property(size: &SizeRange) -> Property {
        let rect = |r: super::Rectangle| spa::utils::Rectangle {
            width: r.width,
            height: r.height,
        };
        Property {
            key: FormatProperties::VideoSize.as_raw(),
            flags: PropertyFlags::empty(),
            value: Value::Choice(ChoiceValue::Rectangle(Choice(
                ChoiceFlags::empty(),
                ChoiceEnum::Range {
                    default: rect(size.default),
                    min: rect(size.min),
                    max: rect(size.max),
                },
            ))),
        }
    }

    fn framerate_property(framerate: &FramerateRange) -> Property {
        let frac = |num: u32| Fraction { num, denom: 1 };
        Property {
            key: FormatProperties::VideoFramerate.as_raw(),
            flags: PropertyFlags::empty(),
            value: Value::Choice(ChoiceValue::Fraction(Choice(
                ChoiceFlags::empty(),
                ChoiceEnum::Range {
                    default: frac(framerate.default),
                    min: frac(framerate.min),
                    max: frac(framerate.max),
                },
            ))),
        }
    }

    /// Serialize one proposal as an `EnumFormat` object
    pub(crate) fn proposal_bytes(proposal: &FormatProposal) -> Result<Vec<u8>, CaptureBackendError> {
        let mut properties = vec![
            id_property(FormatProperties::MediaType, MediaType::Video.as_raw()),
            id_property(FormatProperties::MediaSubtype, MediaSubtype::Raw.as_raw()),
        ];

        match proposal.formats.as_slice() {
            [] => {
                return Err(CaptureBackendError::Negotiation(
                    "Proposal without pixel formats".to_string(),
                ))
            }
            [single] => properties.push(id_property(FormatProperties::VideoFormat, *single)),
            [first, ..] => properties.push(Property {
                key: FormatProperties::VideoFormat.as_raw(),
                flags: PropertyFlags::empty(),
                value: Value::Choice(ChoiceValue::Id(Choice(
                    ChoiceFlags::empty(),
                    ChoiceEnum::Enum {
                        default: Id(*first),
                        alternatives: proposal.formats.iter().map(|f| Id(*f)).collect(),
                    },
                ))),
            }),
        }

        if let Some(modifier) = &proposal.modifier {
            properties.push(Property {
                key: FormatProperties::VideoModifier.as_raw(),
                flags: PropertyFlags::MANDATORY | PropertyFlags::DONT_FIXATE,
                value: Value::Choice(ChoiceValue::Long(Choice(
                    ChoiceFlags::empty(),
                    ChoiceEnum::Enum {
                        default: modifier.preferred as i64,
                        alternatives: modifier.alternatives.iter().map(|m| *m as i64).collect(),
                    },
                ))),
            });
        }

        properties.push(size_property(&proposal.size));
        properties.push(framerate_property(&proposal.framerate));

        serialize(Value::Object(Object {
            type_: SpaTypes::ObjectParamFormat.as_raw(),
            id: ParamType::EnumFormat.as_raw(),
            properties,
        }))
    }

    /// Serialize the `Buffers` param restricting accepted data types
    pub(crate) fn buffers_bytes(data_types: u32) -> Result<Vec<u8>, CaptureBackendError> {
        serialize(Value::Object(Object {
            type_: SpaTypes::ObjectParamBuffers.as_raw(),
            id: ParamType::Buffers.as_raw(),
            properties: vec![Property {
                key: spa::sys::SPA_PARAM_BUFFERS_dataType,
                flags: PropertyFlags::empty(),
                value: Value::Choice(ChoiceValue::Int(Choice(
                    ChoiceFlags::empty(),
                    ChoiceEnum::Flags {
                        default: data_types as i32,
                        flags: Vec::new(),
                    },
                ))),
            }],
        }))
    }

    /// Parse a negotiated `Format` param
    ///
    /// `None` when the param is not raw video or does not parse.
    pub(crate) fn parse_negotiated(param: &Pod) -> Option<FormatDescriptor> {
        let (media_type, media_subtype) = spa::param::format_utils::parse_format(param).ok()?;
        if media_type != MediaType::Video || media_subtype != MediaSubtype::Raw {
            return None;
        }

        let mut info = VideoInfoRaw::new();
        info.parse(param).ok()?;

        let size = info.size();
        let framerate = info.framerate();
        // A zero modifier (linear) is still a modifier when the property exists
        let modifier = has_modifier_property(param).then(|| info.modifier());

        Some(FormatDescriptor {
            format: info.format().as_raw(),
            width: size.width,
            height: size.height,
            framerate: Framerate {
                num: framerate.num,
                denom: framerate.denom,
            },
            modifier,
        })
    }

    fn has_modifier_property(param: &Pod) -> bool {
        let Ok((_, Value::Object(object))) =
            spa::pod::deserialize::PodDeserializer::deserialize_any_from(param.as_bytes())
        else {
            return false;
        };
        object
            .properties
            .iter()
            .any(|p| p.key == FormatProperties::VideoModifier.as_raw())
    }

    /// Borrow serialized bytes as a pod
    pub(crate) fn as_pod(bytes: &[u8]) -> Result<&Pod, CaptureBackendError> {
        Pod::from_bytes(bytes).ok_or_else(|| {
            CaptureBackendError::Negotiation("Serialized pod is malformed".to_string())
        })
    }
}

#[cfg(feature = "pipewire")]
pub(crate) use pod::{as_pod, buffers_bytes, parse_negotiated, proposal_bytes};

/// Version of the libpipewire loaded at runtime
#[cfg(feature = "pipewire")]
pub fn library_version() -> String {
    // SAFETY: pw_get_library_version returns a static NUL-terminated string
    unsafe {
        let ptr = pipewire::sys::pw_get_library_version();
        if ptr.is_null() {
            return String::new();
        }
        std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}
