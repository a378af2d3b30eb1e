use super::format::{accepted_buffer_kinds, build_proposals, dmabuf_negotiation_supported, parse_version};
use super::queue::{drain_latest, process_latest, ProcessOutcome};
use super::sink::{ChannelSink, FrameSink, RawFrame, RawPlane};
use crate::capture::fake::{FakeBuffer, FakeQueue};
use crate::config::CandidateFormat;
use crate::events::{CaptureEvent, StateChangedEvent, StreamStatus};
use crate::frame::{BufferKind, FormatDescriptor, FrameData, Framerate, PixelFormat};
use crate::state::StreamState;
use std::os::fd::AsFd;
use std::sync::{Arc, Mutex};

fn bgrx_format(width: u32, height: u32, modifier: Option<u64>) -> FormatDescriptor {
    FormatDescriptor {
        format: PixelFormat::Bgrx.as_spa(),
        width,
        height,
        framerate: Framerate::per_second(60),
        modifier,
    }
}

fn memory_plane(data: &[u8], stride: i32) -> RawPlane<'_> {
    RawPlane {
        kind: Some(BufferKind::MemPtr),
        fd: None,
        offset: 0,
        stride,
        size: data.len() as u32,
        data: Some(data),
    }
}

// Format proposals

#[test]
fn test_single_modifier_candidate_then_fallback() {
    let candidates = vec![CandidateFormat::new(PixelFormat::Bgra, vec![100, 200])];
    let proposals = build_proposals(60, &candidates);

    assert_eq!(proposals.len(), 2);

    let first = &proposals[0];
    assert_eq!(first.formats, vec![PixelFormat::Bgra.as_spa()]);
    let modifier = first.modifier.as_ref().unwrap();
    assert_eq!(modifier.preferred, 100);
    assert_eq!(modifier.alternatives, vec![100, 200]);
    assert_eq!(first.size.max.width, 8192);
    assert_eq!(first.size.max.height, 4320);
    assert_eq!(first.framerate.default, 60);
    assert_eq!(first.framerate.max, 360);

    let fallback = &proposals[1];
    assert!(fallback.modifier.is_none());
    assert_eq!(fallback.formats, vec![11, 12, 7, 8]);
    assert_eq!(fallback.size.default.width, 320);
    assert_eq!(fallback.size.default.height, 240);
    assert_eq!(fallback.size.min.width, 1);
    assert_eq!(fallback.size.max.height, 8192);
    assert_eq!(fallback.framerate.default, 60);
    assert_eq!(fallback.framerate.min, 0);
    assert_eq!(fallback.framerate.max, 1000);
}

#[test]
fn test_candidates_without_modifiers_only_get_fallback() {
    let candidates = vec![
        CandidateFormat::new(PixelFormat::Rgba, vec![]),
        CandidateFormat::new(PixelFormat::Bgrx, vec![]),
    ];
    let proposals = build_proposals(30, &candidates);

    assert_eq!(proposals.len(), 1);
    assert!(proposals[0].modifier.is_none());
}

#[test]
fn test_proposals_keep_candidate_order() {
    let candidates = vec![
        CandidateFormat::new(PixelFormat::Rgbx, vec![7]),
        CandidateFormat::new(PixelFormat::Bgra, vec![]),
        CandidateFormat::new(PixelFormat::Bgrx, vec![9, 0]),
    ];
    let proposals = build_proposals(60, &candidates);

    let formats: Vec<u32> = proposals.iter().map(|p| p.formats[0]).collect();
    assert_eq!(
        formats,
        vec![PixelFormat::Rgbx.as_spa(), PixelFormat::Bgrx.as_spa(), 11]
    );
    assert_eq!(proposals[1].modifier.as_ref().unwrap().preferred, 9);
}

#[test]
fn test_accepted_buffer_kinds() {
    let memory = BufferKind::MemPtr.mask() | BufferKind::MemFd.mask();

    assert_eq!(accepted_buffer_kinds(&bgrx_format(64, 64, None), false), memory);
    assert_eq!(
        accepted_buffer_kinds(&bgrx_format(64, 64, Some(0)), false),
        memory | BufferKind::DmaBuf.mask()
    );
    assert_eq!(
        accepted_buffer_kinds(&bgrx_format(64, 64, None), true),
        memory | BufferKind::DmaBuf.mask()
    );
}

#[test]
fn test_dmabuf_version_gate() {
    assert!(!dmabuf_negotiation_supported("0.3.32"));
    assert!(dmabuf_negotiation_supported("0.3.33"));
    assert!(dmabuf_negotiation_supported("0.3.48"));
    assert!(dmabuf_negotiation_supported("1.0.5"));
    assert!(!dmabuf_negotiation_supported(""));
    assert!(!dmabuf_negotiation_supported("unknown"));
}

#[test]
fn test_parse_version_fills_missing_parts() {
    assert_eq!(parse_version("0.3"), Some((0, 3, 0)));
    assert_eq!(parse_version(" 1.2.3\n"), Some((1, 2, 3)));
    assert_eq!(parse_version("x.1"), None);
}

// Buffer draining

#[test]
fn test_three_buffers_only_newest_delivered() {
    let mut queue = FakeQueue::with_buffers(vec![
        FakeBuffer::new(1, 64),
        FakeBuffer::new(2, 64),
        FakeBuffer::new(3, 64),
    ]);
    let log = queue.returned_log();

    let mut delivered = Vec::new();
    let mut returned_before_delivery = Vec::new();
    let outcome = process_latest(&mut queue, |buffer| {
        delivered.push(buffer.id);
        returned_before_delivery = log.lock().unwrap().clone();
    });

    assert_eq!(outcome, ProcessOutcome::Delivered);
    assert_eq!(delivered, vec![3]);
    assert_eq!(returned_before_delivery, vec![1, 2]);
    assert_eq!(queue.returned(), vec![1, 2, 3]);
}

#[test]
fn test_zero_size_newest_is_skipped() {
    let mut queue =
        FakeQueue::with_buffers(vec![FakeBuffer::new(1, 64), FakeBuffer::new(2, 0)]);

    let mut called = false;
    let outcome = process_latest(&mut queue, |_| called = true);

    assert_eq!(outcome, ProcessOutcome::Skipped);
    assert!(!called);
    assert_eq!(queue.returned(), vec![1, 2]);
}

#[test]
fn test_unmapped_newest_is_skipped() {
    let mut queue = FakeQueue::with_buffers(vec![FakeBuffer::unmapped(5)]);

    let outcome = process_latest(&mut queue, |_| panic!("must not deliver"));

    assert_eq!(outcome, ProcessOutcome::Skipped);
    assert_eq!(queue.returned(), vec![5]);
}

#[test]
fn test_empty_queue_is_idle() {
    let mut queue = FakeQueue::default();
    assert_eq!(process_latest(&mut queue, |_| {}), ProcessOutcome::Idle);
    assert!(queue.returned().is_empty());
}

#[test]
fn test_dequeued_guard_returns_buffer_on_drop() {
    let mut queue = FakeQueue::with_buffers(vec![FakeBuffer::new(8, 1)]);
    {
        let mut latest = drain_latest(&mut queue).unwrap();
        assert_eq!(latest.buffer_mut().id, 8);
    }
    assert_eq!(queue.returned(), vec![8]);
}

// Raw frames

#[test]
fn test_plane_payload_honours_offset_and_size() {
    let data = [0u8, 1, 2, 3, 4, 5, 6, 7];
    let plane = RawPlane {
        offset: 2,
        size: 4,
        ..memory_plane(&data, 4)
    };
    assert_eq!(plane.payload(), Some(&data[2..6]));

    let overrun = RawPlane {
        offset: 6,
        size: 4,
        ..memory_plane(&data, 4)
    };
    assert_eq!(overrun.payload(), None);
}

#[test]
fn test_memory_frame_copy_uses_packed_stride_when_unset() {
    let format = bgrx_format(2, 1, None);
    let data = [1u8, 2, 3, 4, 5, 6, 7, 8];
    let frame = RawFrame {
        format: &format,
        planes: vec![memory_plane(&data, 0)],
    };

    let owned = frame.to_owned_frame().unwrap();
    match owned.data {
        FrameData::Memory { bytes, stride } => {
            assert_eq!(bytes, data.to_vec());
            assert_eq!(stride, 8);
        }
        FrameData::DmaBuf { .. } => panic!("expected memory frame"),
    }
}

#[test]
fn test_dmabuf_frame_duplicates_fds() {
    let file = std::fs::File::open("/dev/null").unwrap();
    let format = bgrx_format(16, 16, Some(0));
    let frame = RawFrame {
        format: &format,
        planes: vec![RawPlane {
            kind: Some(BufferKind::DmaBuf),
            fd: Some(file.as_fd()),
            offset: 0,
            stride: 64,
            size: 1024,
            data: None,
        }],
    };

    let owned = frame.to_owned_frame().unwrap();
    match owned.data {
        FrameData::DmaBuf { planes } => {
            assert_eq!(planes.len(), 1);
            assert_eq!(planes[0].stride, 64);
        }
        FrameData::Memory { .. } => panic!("expected dma-buf frame"),
    }
}

#[test]
fn test_dmabuf_plane_without_fd_fails() {
    let format = bgrx_format(16, 16, Some(0));
    let frame = RawFrame {
        format: &format,
        planes: vec![RawPlane {
            kind: Some(BufferKind::DmaBuf),
            fd: None,
            offset: 0,
            stride: 64,
            size: 1024,
            data: None,
        }],
    };
    assert!(frame.to_owned_frame().is_err());
}

#[test]
fn test_closure_is_a_sink() {
    let format = bgrx_format(1, 1, None);
    let data = [9u8, 9, 9, 9];
    let sizes = Arc::new(Mutex::new(Vec::new()));

    let mut sink = {
        let sizes = Arc::clone(&sizes);
        move |frame: &RawFrame<'_>| sizes.lock().unwrap().push(frame.planes[0].size)
    };
    sink.on_frame(&RawFrame {
        format: &format,
        planes: vec![memory_plane(&data, 4)],
    });

    assert_eq!(*sizes.lock().unwrap(), vec![4]);
}

// Channel sink

#[tokio::test]
async fn test_channel_sink_forwards_in_order() {
    let (mut sink, mut rx) = ChannelSink::new(4);
    let format = bgrx_format(1, 1, None);
    let data = [1u8, 2, 3, 4];

    sink.on_state_changed(StateChangedEvent {
        state: StreamState::AwaitingFormat,
        previous: StreamState::Connecting,
    });
    sink.on_format(&format);
    sink.on_frame(&RawFrame {
        format: &format,
        planes: vec![memory_plane(&data, 4)],
    });

    assert!(matches!(
        rx.recv().await,
        Some(CaptureEvent::StateChanged(StateChangedEvent {
            state: StreamState::AwaitingFormat,
            ..
        }))
    ));
    assert!(matches!(rx.recv().await, Some(CaptureEvent::FormatChanged(f)) if f == format));
    match rx.recv().await {
        Some(CaptureEvent::Frame(frame)) => {
            assert_eq!(frame.format, format);
            assert!(frame.to_rgba_image().is_some());
        }
        other => panic!("expected frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_channel_sink_drops_frames_when_full() {
    let (mut sink, mut rx) = ChannelSink::new(1);
    let format = bgrx_format(1, 1, None);
    let data = [0u8; 4];
    let frame = || RawFrame {
        format: &format,
        planes: vec![memory_plane(&data, 4)],
    };

    sink.on_frame(&frame());
    sink.on_frame(&frame());
    sink.on_frame(&frame());
    assert_eq!(sink.dropped(), 2);

    assert!(rx.recv().await.is_some_and(|e| e.is_frame()));
    sink.on_frame(&frame());
    assert_eq!(sink.dropped(), 2);
}

#[tokio::test]
async fn test_channel_sink_status_survives_full_channel() {
    let (mut sink, mut rx) = ChannelSink::new(2);
    let status = sink.status();
    let small = bgrx_format(1, 1, None);
    let data = [0u8; 4];

    for _ in 0..2 {
        sink.on_frame(&RawFrame {
            format: &small,
            planes: vec![memory_plane(&data, 4)],
        });
    }

    let renegotiated = bgrx_format(2, 2, None);
    sink.on_format(&renegotiated);
    sink.on_state_changed(StateChangedEvent {
        state: StreamState::Paused,
        previous: StreamState::Streaming,
    });

    // Only the two frames made it into the channel
    assert!(rx.recv().await.is_some_and(|e| e.is_frame()));
    assert!(rx.recv().await.is_some_and(|e| e.is_frame()));
    assert!(rx.try_recv().is_err());

    let current = *status.borrow();
    assert_eq!(current.format, Some(renegotiated));
    assert_eq!(current.state, StreamState::Paused);
    assert_eq!(sink.dropped(), 0);
}

#[tokio::test]
async fn test_channel_sink_status_outlives_sink() {
    let (mut sink, _rx) = ChannelSink::new(1);
    let status = sink.status();
    assert_eq!(*status.borrow(), StreamStatus::default());

    sink.on_format(&bgrx_format(4, 4, None));
    drop(sink);

    assert_eq!(status.borrow().format.map(|f| f.width), Some(4));
}

#[tokio::test]
async fn test_channel_sink_survives_closed_receiver() {
    let (mut sink, rx) = ChannelSink::new(2);
    drop(rx);

    sink.on_format(&bgrx_format(1, 1, None));
    assert_eq!(sink.dropped(), 0);
}

// Pod encoding

#[cfg(feature = "pipewire")]
mod pods {
    use super::*;
    use crate::capture::pipewire::format::pod::{
        as_pod, buffers_bytes, parse_negotiated, proposal_bytes,
    };
    use pipewire::spa;
    use spa::param::format::{FormatProperties, MediaSubtype, MediaType};
    use spa::param::ParamType;
    use spa::pod::deserialize::PodDeserializer;
    use spa::pod::serialize::PodSerializer;
    use spa::pod::{ChoiceValue, Object, Property, PropertyFlags, Value};
    use spa::utils::{Choice, ChoiceEnum, Fraction, Id, Rectangle, SpaTypes};

    fn fixed_format(modifier: Option<i64>) -> Vec<u8> {
        let mut properties = vec![
            Property {
                key: FormatProperties::MediaType.as_raw(),
                flags: PropertyFlags::empty(),
                value: Value::Id(Id(MediaType::Video.as_raw())),
            },
            Property {
                key: FormatProperties::MediaSubtype.as_raw(),
                flags: PropertyFlags::empty(),
                value: Value::Id(Id(MediaSubtype::Raw.as_raw())),
            },
            Property {
                key: FormatProperties::VideoFormat.as_raw(),
                flags: PropertyFlags::empty(),
                value: Value::Id(Id(PixelFormat::Bgrx.as_spa())),
            },
            Property {
                key: FormatProperties::VideoSize.as_raw(),
                flags: PropertyFlags::empty(),
                value: Value::Rectangle(Rectangle {
                    width: 1280,
                    height: 720,
                }),
            },
            Property {
                key: FormatProperties::VideoFramerate.as_raw(),
                flags: PropertyFlags::empty(),
                value: Value::Fraction(Fraction { num: 60, denom: 1 }),
            },
        ];
        if let Some(modifier) = modifier {
            properties.push(Property {
                key: FormatProperties::VideoModifier.as_raw(),
                flags: PropertyFlags::MANDATORY,
                value: Value::Long(modifier),
            });
        }

        PodSerializer::serialize(
            std::io::Cursor::new(Vec::new()),
            &Value::Object(Object {
                type_: SpaTypes::ObjectParamFormat.as_raw(),
                id: ParamType::Format.as_raw(),
                properties,
            }),
        )
        .unwrap()
        .0
        .into_inner()
    }

    #[test]
    fn test_modifier_proposal_serializes_mandatory_modifier() {
        let candidates = vec![CandidateFormat::new(PixelFormat::Bgra, vec![100, 200])];
        let proposals = build_proposals(60, &candidates);
        let bytes = proposal_bytes(&proposals[0]).unwrap();
        let pod = as_pod(&bytes).unwrap();

        let (_, value) = PodDeserializer::deserialize_any_from(pod.as_bytes()).unwrap();
        let Value::Object(object) = value else {
            panic!("expected an object pod");
        };
        assert_eq!(object.id, ParamType::EnumFormat.as_raw());

        let modifier = object
            .properties
            .iter()
            .find(|p| p.key == FormatProperties::VideoModifier.as_raw())
            .unwrap();
        assert!(modifier.flags.contains(PropertyFlags::MANDATORY));
        assert!(modifier.flags.contains(PropertyFlags::DONT_FIXATE));
    }

    #[test]
    fn test_fallback_proposal_has_no_modifier() {
        let proposals = build_proposals(60, &[]);
        let bytes = proposal_bytes(&proposals[0]).unwrap();

        let (_, value) = PodDeserializer::deserialize_any_from(&bytes).unwrap();
        let Value::Object(object) = value else {
            panic!("expected an object pod");
        };
        assert!(!object
            .properties
            .iter()
            .any(|p| p.key == FormatProperties::VideoModifier.as_raw()));
    }

    #[test]
    fn test_parse_negotiated_format() {
        let bytes = fixed_format(None);
        let format = parse_negotiated(as_pod(&bytes).unwrap()).unwrap();

        assert_eq!(format.pixel_format(), Some(PixelFormat::Bgrx));
        assert_eq!((format.width, format.height), (1280, 720));
        assert_eq!(format.framerate, Framerate::per_second(60));
        assert_eq!(format.modifier, None);
    }

    #[test]
    fn test_parse_negotiated_linear_modifier() {
        let bytes = fixed_format(Some(0));
        let format = parse_negotiated(as_pod(&bytes).unwrap()).unwrap();
        assert_eq!(format.modifier, Some(0));
    }

    #[test]
    fn test_buffers_param_sends_data_types_as_flags() {
        let mask = accepted_buffer_kinds(&bgrx_format(64, 64, Some(0)), false);
        let bytes = buffers_bytes(mask).unwrap();

        let (_, value) = PodDeserializer::deserialize_any_from(&bytes).unwrap();
        let Value::Object(object) = value else {
            panic!("expected an object pod");
        };
        assert_eq!(object.id, ParamType::Buffers.as_raw());

        let data_type = object
            .properties
            .iter()
            .find(|p| p.key == spa::sys::SPA_PARAM_BUFFERS_dataType)
            .unwrap();
        match &data_type.value {
            Value::Choice(ChoiceValue::Int(Choice(_, ChoiceEnum::Flags { default, .. }))) => {
                assert_eq!(*default, mask as i32);
            }
            other => panic!("expected a flags choice, got {:?}", other),
        }
    }
}
