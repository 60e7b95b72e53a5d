/*************
NOTICE: This module was taken and modified from the unmaintained crate `mpeg_encoder`, at
https://github.com/sebcrozet/mpeg_encoder and https://crates.io/crates/mpeg_encoder.
This usage was not endorsed by him. His crate is licensed under the 3 Clause BSD License:

Copyright (c) 2017, Sébastien Crozet
All rights reserved.

Redistribution and use in source and binary forms, with or without
modification, are permitted provided that the following conditions are met:

1. Redistributions of source code must retain the above copyright notice, this
   list of conditions and the following disclaimer.

2. Redistributions in binary form must reproduce the above copyright notice,
   this list of conditions and the following disclaimer in the documentation
   and/or other materials provided with the distribution.

3. Neither the name of the author nor the names of its contributors may be used
   to endorse or promote products derived from this software without specific
   prior written permission.

THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND
ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE IMPLIED
WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE
FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER
CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY,
OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.
 *************/

//! MPEG-4 recording through libav. Only built with the `ffmpeg` feature.

// Inspired by the muxing sample: http://ffmpeg.org/doxygen/trunk/muxing_8c-source.html

use crate::error::RecordError;
use crate::frame_writer::{FrameWriter, RecordingSettings};
use ffmpeg_sys_next::{SwsContext, AVCodec, AVCodecContext, AVPacket, AVFormatContext, AVStream,
                      AVFrame, AVRational, AVPixelFormat, AVPicture, AVCodecID};
use image::RgbImage;
use std::ffi::CString;
use std::fs;
use std::mem;
use std::ptr;
use std::sync::Once;

static AVFORMAT_INIT: Once = Once::new();

const BIT_RATE: i64 = 2_000_000;
const GOP_SIZE: i32 = 10;
const MAX_B_FRAMES: i32 = 1;
const AVIO_FLAG_WRITE: i32 = 2;

fn failed(what: &str) -> RecordError {
    RecordError::Encoder(what.to_owned())
}

/// Encodes RGB frames into the container guessed from the output path.
pub struct Encoder {
    tmp_frame_buf: Vec<u8>,
    frame_buf: Vec<u8>,
    target_width: usize,
    target_height: usize,
    tmp_frame: *mut AVFrame,
    frame: *mut AVFrame,
    context: *mut AVCodecContext,
    format_context: *mut AVFormatContext,
    video_st: *mut AVStream,
    scale_context: *mut SwsContext,
    header_written: bool,
    finished: bool,
}

// All libav state is owned by the encoder and only touched by the thread that holds it.
unsafe impl Send for Encoder {}

impl Encoder {
    /// Opens the output file and writes the container header.
    pub fn new(settings: &RecordingSettings) -> Result<Encoder, RecordError> {
        AVFORMAT_INIT.call_once(|| unsafe {
            ffmpeg_sys_next::av_register_all();
        });

        if let Some(parent) = settings.path.parent() {
            fs::create_dir_all(parent)?;
        }

        // width and height must be a multiple of two.
        let target_width = (settings.width as usize + 1) & !1;
        let target_height = (settings.height as usize + 1) & !1;

        let mut encoder = Encoder {
            tmp_frame_buf: Vec::new(),
            frame_buf: Vec::new(),
            target_width,
            target_height,
            tmp_frame: ptr::null_mut(),
            frame: ptr::null_mut(),
            context: ptr::null_mut(),
            format_context: ptr::null_mut(),
            video_st: ptr::null_mut(),
            scale_context: ptr::null_mut(),
            header_written: false,
            finished: false,
        };

        let path = settings.path.to_str().ok_or_else(|| failed("output path is not valid UTF-8"))?;
        let path = CString::new(path).map_err(|_| failed("output path contains a NUL byte"))?;
        let fps = settings.fps.round().max(1.0) as i32;

        // on error, Drop frees whatever was allocated so far
        unsafe { encoder.open(&path, fps)?; }
        Ok(encoder)
    }

    unsafe fn open(&mut self, path: &CString, fps: i32) -> Result<(), RecordError> {
        let mut fmt = ptr::null_mut();
        let _ = ffmpeg_sys_next::avformat_alloc_output_context2(&mut fmt, ptr::null_mut(), ptr::null(), path.as_ptr());

        if fmt.is_null() {
            // could not guess, default to MPEG
            let mpeg = CString::new(&b"mpeg"[..]).map_err(|_| failed("bad format name"))?;
            let _ = ffmpeg_sys_next::avformat_alloc_output_context2(&mut fmt, ptr::null_mut(), mpeg.as_ptr(), path.as_ptr());
        }

        self.format_context = fmt;
        if self.format_context.is_null() {
            return Err(failed("unable to create the output context"));
        }

        let oformat = (*self.format_context).oformat;
        if (*oformat).video_codec == AVCodecID::AV_CODEC_ID_NONE {
            return Err(failed("the output container does not support video"));
        }

        let codec: *mut AVCodec = ffmpeg_sys_next::avcodec_find_encoder((*oformat).video_codec);
        if codec.is_null() {
            return Err(failed("codec not found"));
        }

        self.video_st = ffmpeg_sys_next::avformat_new_stream(self.format_context, ptr::null());
        if self.video_st.is_null() {
            return Err(failed("failed to allocate the video stream"));
        }
        (*self.video_st).id = ((*self.format_context).nb_streams - 1) as i32;

        self.context = ffmpeg_sys_next::avcodec_alloc_context3(codec);
        if self.context.is_null() {
            return Err(failed("could not allocate video codec context"));
        }

        let pix_fmt = AVPixelFormat::AV_PIX_FMT_YUV420P;
        (*self.context).codec_id = (*oformat).video_codec;
        (*self.context).bit_rate = BIT_RATE;
        (*self.context).width = self.target_width as i32;
        (*self.context).height = self.target_height as i32;
        (*self.context).time_base = AVRational { num: 1, den: fps };
        (*self.video_st).time_base = (*self.context).time_base;
        (*self.context).gop_size = GOP_SIZE;
        (*self.context).max_b_frames = MAX_B_FRAMES;
        (*self.context).pix_fmt = pix_fmt;

        if (*self.context).codec_id == AVCodecID::AV_CODEC_ID_MPEG1VIDEO {
            // avoids macroblocks in which some coeffs overflow
            (*self.context).mb_decision = 2;
        }

        if ffmpeg_sys_next::avcodec_open2(self.context, codec, ptr::null_mut()) < 0 {
            return Err(failed("could not open the codec"));
        }

        self.frame = ffmpeg_sys_next::av_frame_alloc();
        if self.frame.is_null() {
            return Err(failed("could not allocate the video frame"));
        }

        (*self.frame).format = pix_fmt as i32;
        (*self.frame).width = (*self.context).width;
        (*self.frame).height = (*self.context).height;
        (*self.frame).pts = 0;

        let nframe_bytes = ffmpeg_sys_next::avpicture_get_size(pix_fmt, self.target_width as i32, self.target_height as i32);
        if nframe_bytes <= 0 {
            return Err(failed("could not size the picture buffer"));
        }
        self.frame_buf = vec![0; nframe_bytes as usize];

        let _ = ffmpeg_sys_next::avpicture_fill(
            self.frame as *mut AVPicture,
            self.frame_buf.as_ptr(),
            pix_fmt,
            self.target_width as i32,
            self.target_height as i32,
        );

        // width, height, data and linesize are set per frame
        self.tmp_frame = ffmpeg_sys_next::av_frame_alloc();
        if self.tmp_frame.is_null() {
            return Err(failed("could not allocate the video frame"));
        }
        (*self.tmp_frame).format = AVPixelFormat::AV_PIX_FMT_RGB24 as i32;

        if ffmpeg_sys_next::avcodec_parameters_from_context((*self.video_st).codecpar, self.context) < 0 {
            return Err(failed("failed to set codec parameters"));
        }

        if ffmpeg_sys_next::avio_open(&mut (*self.format_context).pb, path.as_ptr(), AVIO_FLAG_WRITE) < 0 {
            return Err(failed("failed to open the output file"));
        }

        if ffmpeg_sys_next::avformat_write_header(self.format_context, ptr::null_mut()) < 0 {
            return Err(failed("failed to write the container header"));
        }

        self.header_written = true;
        Ok(())
    }

    fn encode_rgb(&mut self, width: usize, height: usize, data: &[u8]) -> Result<(), RecordError> {
        if data.is_empty() || data.len() != width * height * 3 {
            return Err(failed("frame buffer does not match its dimensions"));
        }

        self.tmp_frame_buf.clear();
        self.tmp_frame_buf.extend_from_slice(data);

        unsafe {
            (*self.tmp_frame).width = width as i32;
            (*self.tmp_frame).height = height as i32;

            let _ = ffmpeg_sys_next::avpicture_fill(
                self.tmp_frame as *mut AVPicture,
                self.tmp_frame_buf.as_ptr(),
                AVPixelFormat::AV_PIX_FMT_RGB24,
                width as i32,
                height as i32,
            );

            self.scale_context = ffmpeg_sys_next::sws_getCachedContext(
                self.scale_context,
                width as i32,
                height as i32,
                AVPixelFormat::AV_PIX_FMT_RGB24,
                self.target_width as i32,
                self.target_height as i32,
                AVPixelFormat::AV_PIX_FMT_YUV420P,
                ffmpeg_sys_next::SWS_BICUBIC as i32,
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null(),
            );
            if self.scale_context.is_null() {
                return Err(failed("could not create the scaling context"));
            }

            let _ = ffmpeg_sys_next::sws_scale(
                self.scale_context,
                &(*self.tmp_frame).data[0] as *const *mut u8 as *const *const u8,
                &(*self.tmp_frame).linesize[0],
                0,
                height as i32,
                &(*self.frame).data[0] as *const *mut u8,
                &(*self.frame).linesize[0],
            );

            self.write_packet(self.frame)?;

            (*self.frame).pts += ffmpeg_sys_next::av_rescale_q(1, (*self.context).time_base, (*self.video_st).time_base);
        }
        Ok(())
    }

    /// Encodes `frame` (null flushes) and writes the packet if one came out.
    /// Returns whether a packet was produced.
    unsafe fn write_packet(&mut self, frame: *const AVFrame) -> Result<bool, RecordError> {
        let mut pkt: AVPacket = mem::zeroed();
        ffmpeg_sys_next::av_init_packet(&mut pkt);
        pkt.data = ptr::null_mut();
        pkt.size = 0;

        let mut got_output = 0;
        if ffmpeg_sys_next::avcodec_encode_video2(self.context, &mut pkt, frame, &mut got_output) < 0 {
            return Err(failed("error encoding frame"));
        }

        if got_output != 0 {
            let written = ffmpeg_sys_next::av_interleaved_write_frame(self.format_context, &mut pkt);
            ffmpeg_sys_next::av_free_packet(&mut pkt);
            if written < 0 {
                return Err(failed("error writing frame"));
            }
        }
        Ok(got_output != 0)
    }

    unsafe fn free(&mut self) {
        if !self.context.is_null() {
            ffmpeg_sys_next::avcodec_free_context(&mut self.context);
        }
        if !self.frame.is_null() {
            ffmpeg_sys_next::av_frame_free(&mut self.frame);
        }
        if !self.tmp_frame.is_null() {
            ffmpeg_sys_next::av_frame_free(&mut self.tmp_frame);
        }
        if !self.scale_context.is_null() {
            ffmpeg_sys_next::sws_freeContext(self.scale_context);
            self.scale_context = ptr::null_mut();
        }
        if !self.format_context.is_null() {
            if !(*self.format_context).pb.is_null() {
                let _ = ffmpeg_sys_next::avio_closep(&mut (*self.format_context).pb);
            }
            ffmpeg_sys_next::avformat_free_context(self.format_context);
            self.format_context = ptr::null_mut();
        }
    }
}

impl FrameWriter for Encoder {
    fn write(&mut self, image: &RgbImage) -> Result<(), RecordError> {
        if self.finished {
            return Err(failed("write after finish"));
        }
        self.encode_rgb(image.width() as usize, image.height() as usize, image.as_raw())
    }

    /// Drains the delayed frames, writes the trailer and closes the file.
    fn finish(&mut self) -> Result<(), RecordError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let result = unsafe {
            let mut flushed = Ok(());
            if self.header_written {
                loop {
                    match self.write_packet(ptr::null()) {
                        Ok(true) => continue,
                        Ok(false) => break,
                        Err(e) => {
                            flushed = Err(e);
                            break;
                        },
                    }
                }
                if ffmpeg_sys_next::av_write_trailer(self.format_context) < 0 && flushed.is_ok() {
                    flushed = Err(failed("error writing trailer"));
                }
            }
            flushed
        };

        unsafe { self.free(); }
        result
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.finish();
        }
        unsafe { self.free(); }
    }
}
