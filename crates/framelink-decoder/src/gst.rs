//! GStreamer decoder backend (`gstreamer` feature).
//!
//! # Decoder priority
//! 1. `vaapih26Xdec`   AMD/Intel VA-API
//! 2. `vaapidecodebin` VA-API auto-select
//! 3. `nvh26Xdec`      NVIDIA NVDEC
//! 4. `avdec_h26X`     software libavcodec, last resort
//!
//! # Pipeline
//! ```text
//! appsrc → h26Xparse → [decoder] → videoconvert → videoscale → video/x-raw,format=BGRA → appsink
//! ```
//! `need-data` on the appsrc hands out input slots, `new-sample` on the
//! appsink reports outputs and bus errors arrive through a sync handler, so
//! every callback runs on a GStreamer streaming thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use framelink_core::{DecoderError, VideoCodec};
use framelink_renderer::SurfaceHandle;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app::{AppSink, AppSinkCallbacks, AppSrc, AppSrcCallbacks};
use tracing::{debug, info, warn};

use crate::backend::{
    CodecCallbacks, DecoderBackend, DecoderFormat, DecoderParams, DecoderProvider, DecoderRegistry, InputKind,
};

/// Decoder candidates per codec, in priority order.
static DECODER_PRIORITY: &[(VideoCodec, &str, &str)] = &[
    (VideoCodec::H264, "vaapih264dec", "AMD/Intel VA-API H.264"),
    (VideoCodec::H264, "vaapidecodebin", "VA-API auto-select"),
    (VideoCodec::H264, "nvh264dec", "NVIDIA NVDEC H.264"),
    (VideoCodec::H264, "avdec_h264", "Software libavcodec (last resort)"),
    (VideoCodec::H265, "vaapih265dec", "AMD/Intel VA-API H.265"),
    (VideoCodec::H265, "vaapidecodebin", "VA-API auto-select"),
    (VideoCodec::H265, "nvh265dec", "NVIDIA NVDEC H.265"),
    (VideoCodec::H265, "avdec_h265", "Software libavcodec (last resort)"),
];

const INPUT_CAPACITY: usize = 2 * 1024 * 1024;
const APPSRC_INPUT_INDEX: usize = 0;

// ── Probe ─────────────────────────────────────────────────────────────────────

/// Register one provider per installed decoder element, best first.
/// Returns how many were registered.
pub fn register_available(registry: &mut DecoderRegistry) -> Result<usize, DecoderError> {
    gst::init().map_err(|e| DecoderError::GStreamerPipeline(e.to_string()))?;
    let mut found = 0;
    for (codec, element, label) in DECODER_PRIORITY {
        if gst::ElementFactory::find(element).is_some() {
            info!("GStreamer decoder available: {} for {} ({})", element, codec, label);
            registry.register(GStreamerProvider { codec: *codec, element });
            found += 1;
        } else {
            debug!("GStreamer decoder '{}' not installed", element);
        }
    }
    if found == 0 {
        warn!("No GStreamer video decoder found");
    }
    Ok(found)
}

// ── GStreamerProvider ─────────────────────────────────────────────────────────

pub struct GStreamerProvider {
    codec: VideoCodec,
    element: &'static str,
}

impl DecoderProvider for GStreamerProvider {
    fn name(&self) -> &str {
        self.element
    }

    fn supports(&self, codec: VideoCodec) -> bool {
        codec == self.codec
    }

    fn is_hardware_accelerated(&self) -> bool {
        !self.element.starts_with("avdec_")
    }

    fn create(&self) -> Result<Box<dyn DecoderBackend>, DecoderError> {
        Ok(Box::new(GStreamerDecoder {
            element: self.element,
            pipeline: None,
            appsrc: None,
            samples: Arc::new(Mutex::new(HashMap::new())),
            surface: None,
        }))
    }
}

// ── GStreamerDecoder ──────────────────────────────────────────────────────────

pub struct GStreamerDecoder {
    element: &'static str,
    pipeline: Option<gst::Pipeline>,
    appsrc: Option<AppSrc>,
    /// Decoded samples waiting for `release_output`.
    samples: Arc<Mutex<HashMap<usize, gst::Sample>>>,
    surface: Option<SurfaceHandle>,
}

fn caps_and_parser(codec: VideoCodec) -> Result<(&'static str, &'static str), DecoderError> {
    match codec {
        VideoCodec::H264 => Ok(("video/x-h264", "h264parse")),
        VideoCodec::H265 => Ok(("video/x-h265", "h265parse")),
        VideoCodec::Unknown => Err(DecoderError::NoCompatibleDecoder { codec }),
    }
}

impl DecoderBackend for GStreamerDecoder {
    fn name(&self) -> &str {
        self.element
    }

    fn configure(
        &mut self,
        format: &DecoderFormat,
        surface: SurfaceHandle,
        callbacks: Arc<dyn CodecCallbacks>,
    ) -> Result<(), DecoderError> {
        let (caps_name, parser) = caps_and_parser(format.codec)?;
        let element = self.element;
        let (width, height) = (format.width, format.height);
        let pipeline_str = format!(
            "appsrc name=src format=time is-live=true do-timestamp=false \
             ! {parser} \
             ! {element} \
             ! videoconvert \
             ! videoscale \
             ! video/x-raw,format=BGRA,width={width},height={height} \
             ! appsink name=sink sync=false max-buffers=4 drop=false"
        );

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| DecoderError::ConfigurationRejected { reason: e.to_string() })?
            .downcast::<gst::Pipeline>()
            .map_err(|_| DecoderError::GStreamerPipeline("Not a pipeline".into()))?;

        let appsrc = pipeline
            .by_name("src")
            .and_then(|element| element.downcast::<AppSrc>().ok())
            .ok_or_else(|| DecoderError::GStreamerPipeline("No appsrc".into()))?;

        let appsink = pipeline
            .by_name("sink")
            .and_then(|element| element.downcast::<AppSink>().ok())
            .ok_or_else(|| DecoderError::GStreamerPipeline("No appsink".into()))?;

        let src_caps = gst::Caps::builder(caps_name)
            .field("stream-format", "byte-stream")
            .field("alignment", "au")
            .build();
        appsrc.set_caps(Some(&src_caps));

        // appsrc has a single queue and no input slots, so every buffer it
        // asks for uses index 0.
        let input_callbacks = Arc::clone(&callbacks);
        appsrc.set_callbacks(
            AppSrcCallbacks::builder()
                .need_data(move |_src, _len| {
                    input_callbacks.on_input_buffer_available(APPSRC_INPUT_INDEX, INPUT_CAPACITY);
                })
                .build(),
        );

        let next_output = Arc::new(AtomicUsize::new(0));
        let samples = Arc::clone(&self.samples);
        let output_callbacks = Arc::clone(&callbacks);
        appsink.set_callbacks(
            AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    let pts = sample
                        .buffer()
                        .and_then(|buffer| buffer.pts())
                        .map(|ts| ts.useconds())
                        .unwrap_or(0);
                    let index = next_output.fetch_add(1, Ordering::Relaxed);
                    samples
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(index, sample);
                    output_callbacks.on_output_buffer_available(index, pts);
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        let bus = pipeline
            .bus()
            .ok_or_else(|| DecoderError::GStreamerPipeline("Pipeline has no bus".into()))?;
        let error_callbacks = callbacks;
        bus.set_sync_handler(move |_bus, msg| {
            match msg.view() {
                gst::MessageView::Error(err) => {
                    let origin = err.src().map(|s| s.path_string().to_string()).unwrap_or_default();
                    error_callbacks.on_error(DecoderError::Fatal {
                        reason: format!("{origin}: {}", err.error()),
                    });
                }
                gst::MessageView::Warning(w) => warn!("GStreamer warning: {}", w.error()),
                _ => {}
            }
            gst::BusSyncReply::Pass
        });

        info!("GStreamerDecoder({}) configured {}x{}", element, width, height);
        self.pipeline = Some(pipeline);
        self.appsrc = Some(appsrc);
        self.surface = Some(surface);
        Ok(())
    }

    fn start(&mut self) -> Result<(), DecoderError> {
        let pipeline = self.pipeline.as_ref().ok_or(DecoderError::NotInitialized)?;
        pipeline
            .set_state(gst::State::Playing)
            .map_err(|_| DecoderError::GStreamerPipeline("Failed to start pipeline".into()))?;
        Ok(())
    }

    fn queue_input(
        &mut self,
        _index: usize,
        data: &[u8],
        presentation_time_us: u64,
        kind: InputKind,
    ) -> Result<(), DecoderError> {
        let appsrc = self.appsrc.as_ref().ok_or(DecoderError::NotInitialized)?;
        let mut buffer = gst::Buffer::from_mut_slice(data.to_vec());
        {
            let buffer = buffer.get_mut().ok_or_else(|| DecoderError::QueueFailed {
                reason: "buffer not writable".into(),
            })?;
            buffer.set_pts(gst::ClockTime::from_useconds(presentation_time_us));
            if kind == InputKind::CodecConfig {
                buffer.set_flags(gst::BufferFlags::HEADER);
            }
        }
        appsrc
            .push_buffer(buffer)
            .map_err(|e| DecoderError::QueueFailed {
                reason: format!("appsrc push failed: {e:?}"),
            })?;
        Ok(())
    }

    fn release_output(&mut self, index: usize, render: bool) -> Result<(), DecoderError> {
        let sample = self
            .samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&index);
        if render && sample.is_some() {
            if let Some(surface) = &self.surface {
                surface.write_frame();
            }
        }
        Ok(())
    }

    fn set_parameters(&mut self, params: &DecoderParams) -> Result<(), DecoderError> {
        // Operating rate and priority have no GStreamer equivalent on a
        // running pipeline; latency is already minimal (sync=false).
        debug!("GStreamerDecoder({}) parameters: {:?}", self.element, params);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            if let Some(bus) = pipeline.bus() {
                bus.unset_sync_handler();
            }
            let _ = pipeline.set_state(gst::State::Null);
            info!("GStreamerDecoder({}) stopped", self.element);
        }
        self.appsrc = None;
        self.samples.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl Drop for GStreamerDecoder {
    fn drop(&mut self) {
        self.stop();
    }
}
