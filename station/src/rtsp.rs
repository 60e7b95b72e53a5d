//! RTSP cameras through libav. Only built with the `ffmpeg` feature.

use crate::connection::{Connection, Connector};
use crate::error::{ConnectError, StreamError};
use chrono::Local;
use ffmpeg_sys_next::{AVCodecContext, AVDictionary, AVFormatContext, AVFrame, AVMediaType, AVPacket, AVPixelFormat, SwsContext};
use image::RgbImage;
use station_types::{CameraAddress, Frame, StreamProperties};
use std::ffi::CString;
use std::os::raw::c_int;
use std::ptr;
use std::sync::Once;

static NETWORK_INIT: Once = Once::new();

/// Socket timeout for reads, in microseconds. A dead camera ends the stream instead of hanging.
const SOCKET_TIMEOUT_MICROS: &str = "5000000";

pub struct RtspConnector {
    _private: (),
}

impl RtspConnector {
    pub fn new() -> RtspConnector {
        NETWORK_INIT.call_once(|| unsafe {
            ffmpeg_sys_next::avformat_network_init();
        });
        RtspConnector { _private: () }
    }
}

impl Default for RtspConnector {
    fn default() -> RtspConnector {
        RtspConnector::new()
    }
}

impl Connector for RtspConnector {
    fn connect(&self, address: &CameraAddress) -> Result<Box<dyn Connection>, ConnectError> {
        let url = CString::new(address.url()).map_err(|_| ConnectError::Backend("address contains a NUL byte".to_owned()))?;
        let mut camera = RtspCamera::empty();

        // on error, Drop frees whatever was allocated so far
        unsafe { camera.open(&url) }.map_err(ConnectError::Backend)?;
        Ok(Box::new(camera))
    }
}

struct RtspCamera {
    format_context: *mut AVFormatContext,
    decoder: *mut AVCodecContext,
    scale_context: *mut SwsContext,
    frame: *mut AVFrame,
    stream_index: c_int,
    properties: StreamProperties,
}

// The handle never leaves the capture thread that opened it.
unsafe impl Send for RtspCamera {}

fn dict_set(options: &mut *mut AVDictionary, key: &str, value: &str) -> Result<(), String> {
    let key = CString::new(key).map_err(|e| e.to_string())?;
    let value = CString::new(value).map_err(|e| e.to_string())?;
    unsafe {
        ffmpeg_sys_next::av_dict_set(options, key.as_ptr(), value.as_ptr(), 0);
    }
    Ok(())
}

impl RtspCamera {
    fn empty() -> RtspCamera {
        RtspCamera {
            format_context: ptr::null_mut(),
            decoder: ptr::null_mut(),
            scale_context: ptr::null_mut(),
            frame: ptr::null_mut(),
            stream_index: -1,
            properties: StreamProperties::new(0, 0, 0.0),
        }
    }

    unsafe fn open(&mut self, url: &CString) -> Result<(), String> {
        let mut options: *mut AVDictionary = ptr::null_mut();
        dict_set(&mut options, "rtsp_transport", "tcp")?;
        dict_set(&mut options, "stimeout", SOCKET_TIMEOUT_MICROS)?;

        let opened = ffmpeg_sys_next::avformat_open_input(&mut self.format_context, url.as_ptr(), ptr::null_mut(), &mut options);
        ffmpeg_sys_next::av_dict_free(&mut options);
        if opened < 0 {
            self.format_context = ptr::null_mut();
            return Err(format!("could not open stream (error {})", opened));
        }

        if ffmpeg_sys_next::avformat_find_stream_info(self.format_context, ptr::null_mut()) < 0 {
            return Err("could not read stream info".to_owned());
        }

        let mut codec = ptr::null_mut();
        self.stream_index = ffmpeg_sys_next::av_find_best_stream(
            self.format_context, AVMediaType::AVMEDIA_TYPE_VIDEO, -1, -1, &mut codec, 0);
        if self.stream_index < 0 || codec.is_null() {
            return Err("no decodable video stream".to_owned());
        }

        let stream = *(*self.format_context).streams.offset(self.stream_index as isize);

        self.decoder = ffmpeg_sys_next::avcodec_alloc_context3(codec);
        if self.decoder.is_null() {
            return Err("could not allocate decoder".to_owned());
        }
        if ffmpeg_sys_next::avcodec_parameters_to_context(self.decoder, (*stream).codecpar) < 0 {
            return Err("could not copy codec parameters".to_owned());
        }
        if ffmpeg_sys_next::avcodec_open2(self.decoder, codec, ptr::null_mut()) < 0 {
            return Err("could not open decoder".to_owned());
        }

        self.frame = ffmpeg_sys_next::av_frame_alloc();
        if self.frame.is_null() {
            return Err("could not allocate frame".to_owned());
        }

        let rate = (*stream).avg_frame_rate;
        let fps = if rate.den > 0 { f64::from(rate.num) / f64::from(rate.den) } else { 0.0 };
        self.properties = StreamProperties::new((*self.decoder).width.max(0) as u32, (*self.decoder).height.max(0) as u32, fps);
        Ok(())
    }

    unsafe fn to_rgb(&mut self) -> Result<RgbImage, StreamError> {
        let width = (*self.frame).width;
        let height = (*self.frame).height;
        if width <= 0 || height <= 0 {
            return Err(StreamError::Decode("decoded frame has no size".to_owned()));
        }

        self.scale_context = ffmpeg_sys_next::sws_getCachedContext(
            self.scale_context,
            width,
            height,
            std::mem::transmute::<c_int, AVPixelFormat>((*self.frame).format),
            width,
            height,
            AVPixelFormat::AV_PIX_FMT_RGB24,
            ffmpeg_sys_next::SWS_BILINEAR as c_int,
            ptr::null_mut(),
            ptr::null_mut(),
            ptr::null(),
        );
        if self.scale_context.is_null() {
            return Err(StreamError::Decode("unsupported pixel format".to_owned()));
        }

        let mut image = RgbImage::new(width as u32, height as u32);
        let stride = [3 * width, 0, 0, 0];
        let planes = [image.as_mut_ptr(), ptr::null_mut(), ptr::null_mut(), ptr::null_mut()];

        ffmpeg_sys_next::sws_scale(
            self.scale_context,
            (*self.frame).data.as_ptr() as *const *const u8,
            (*self.frame).linesize.as_ptr(),
            0,
            height,
            planes.as_ptr(),
            stride.as_ptr(),
        );
        Ok(image)
    }
}

impl Connection for RtspCamera {
    fn properties(&self) -> StreamProperties {
        self.properties
    }

    fn disable_buffering(&mut self) {
        unsafe {
            (*self.format_context).flags |= ffmpeg_sys_next::AVFMT_FLAG_NOBUFFER as c_int;
        }
    }

    fn read_frame(&mut self) -> Result<Frame, StreamError> {
        unsafe {
            let mut packet: AVPacket = std::mem::zeroed();
            loop {
                if ffmpeg_sys_next::av_read_frame(self.format_context, &mut packet) < 0 {
                    return Err(StreamError::EndOfStream);
                }

                let ours = packet.stream_index == self.stream_index;
                let sent = if ours { ffmpeg_sys_next::avcodec_send_packet(self.decoder, &packet) } else { 0 };
                ffmpeg_sys_next::av_packet_unref(&mut packet);

                if sent < 0 {
                    return Err(StreamError::Decode(format!("decoder rejected packet (error {})", sent)));
                }
                if ours && ffmpeg_sys_next::avcodec_receive_frame(self.decoder, self.frame) == 0 {
                    let image = self.to_rgb()?;
                    return Ok(Frame::captured_at(image, Local::now()));
                }
            }
        }
    }
}

impl Drop for RtspCamera {
    fn drop(&mut self) {
        unsafe {
            if !self.scale_context.is_null() {
                ffmpeg_sys_next::sws_freeContext(self.scale_context);
            }
            if !self.frame.is_null() {
                ffmpeg_sys_next::av_frame_free(&mut self.frame);
            }
            if !self.decoder.is_null() {
                ffmpeg_sys_next::avcodec_free_context(&mut self.decoder);
            }
            if !self.format_context.is_null() {
                ffmpeg_sys_next::avformat_close_input(&mut self.format_context);
            }
        }
    }
}
