// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Runs a synthetic stream through the picture orchestrator and prints the derived per-picture
//! state. Memory and command emission are provided by the in-memory dummy backend.

use argh::FromArgs;
use hevc_enc_hal::backend::dummy::DummyGpu;
use hevc_enc_hal::backend::dummy::RecordingCommandBuilder;
use hevc_enc_hal::backend::ResourceHandle;
use hevc_enc_hal::codec::h265::params::CodecPicture;
use hevc_enc_hal::codec::h265::params::CodingType;
use hevc_enc_hal::codec::h265::params::FrameIdx;
use hevc_enc_hal::codec::h265::params::PictureParameters;
use hevc_enc_hal::codec::h265::params::RateControlMethod;
use hevc_enc_hal::codec::h265::params::SequenceParameters;
use hevc_enc_hal::codec::h265::params::SliceParameters;
use hevc_enc_hal::codec::h265::params::SliceType;
use hevc_enc_hal::encoder::hevc::CodecFunction;
use hevc_enc_hal::encoder::hevc::EncoderConfig;
use hevc_enc_hal::encoder::hevc::PictureInput;
use hevc_enc_hal::encoder::hevc::PictureOrchestrator;
use hevc_enc_hal::encoder::hevc::PictureSurfaces;
use hevc_enc_hal::Resolution;

/// HEVC picture setup simulator
#[derive(Debug, FromArgs)]
struct Args {
    /// frame width
    #[argh(option, default = "1920")]
    width: u32,

    /// frame height
    #[argh(option, default = "1080")]
    height: u32,

    /// number of pictures to set up
    #[argh(option, default = "16")]
    count: u32,

    /// number of reference frames kept by the client (1 to 8)
    #[argh(option, default = "2")]
    num_refs: u8,

    /// every Nth picture is a non-reference picture, 0 to disable
    #[argh(option, default = "0")]
    non_ref_period: u32,

    /// use VBR instead of constant QP
    #[argh(switch)]
    vbr: bool,

    /// use the VDEnc pipeline
    #[argh(switch)]
    vdenc: bool,

    /// width and height of the second half of the stream, e.g. 1280x720
    #[argh(option)]
    resize_to: Option<String>,
}

fn parse_resolution(s: &str) -> Result<Resolution, String> {
    let (w, h) = s
        .split_once('x')
        .ok_or_else(|| format!("invalid resolution {}", s))?;
    let width = w.parse().map_err(|e| format!("invalid width: {}", e))?;
    let height = h.parse().map_err(|e| format!("invalid height: {}", e))?;

    Ok(Resolution::from((width, height)))
}

fn sequence(resolution: Resolution, vbr: bool) -> SequenceParameters {
    let mut seq = SequenceParameters::with_frame_size(resolution.width, resolution.height, 3);
    if vbr {
        seq.rate_control_method = RateControlMethod::Vbr;
        seq.target_bit_rate = 4_000_000;
        seq.max_bit_rate = 6_000_000;
    }
    seq
}

fn main() {
    env_logger::init();

    let args: Args = argh::from_env();

    let resize_to = match args.resize_to.as_deref().map(parse_resolution).transpose() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    let config = EncoderConfig {
        codec_function: if args.vdenc {
            CodecFunction::EncVdencPak
        } else {
            CodecFunction::EncPak
        },
        vdenc_enabled: args.vdenc,
        ..Default::default()
    };
    let mut orchestrator = PictureOrchestrator::new(config, DummyGpu::default());
    let mut builder = RecordingCommandBuilder::default();

    let mut resolution = Resolution::from((args.width, args.height));
    let mut seq = sequence(resolution, args.vbr);
    let mut new_sequence = true;
    // Frame-store indices of the reference pictures, the most recent last.
    let mut dpb: Vec<(FrameIdx, i32)> = Vec::new();
    let num_refs = usize::from(args.num_refs.clamp(1, 8));

    for n in 0..args.count {
        if let Some(target) = resize_to {
            if n == args.count / 2 && target != resolution {
                resolution = target;
                seq = sequence(resolution, args.vbr);
                new_sequence = true;
                dpb.clear();
            }
        }

        let poc = n as i32;
        // Cycle through frame-store indices so that references stay valid.
        let recon = FrameIdx::new((n % 32) as u8).expect("frame index out of range");
        let used_as_ref = args.non_ref_period == 0 || (n + 1) % args.non_ref_period != 0;

        let mut pic = PictureParameters {
            curr_original_pic: CodecPicture::new(recon),
            curr_reconstructed_pic: CodecPicture::new(recon),
            curr_pic_order_cnt: poc,
            coding_type: if dpb.is_empty() {
                CodingType::I
            } else {
                CodingType::P
            },
            used_as_ref,
            ..Default::default()
        };

        let width_in_lcu = resolution.width.div_ceil(64);
        let height_in_lcu = resolution.height.div_ceil(64);
        let mut slice = SliceParameters {
            num_lcus_in_slice: width_in_lcu * height_in_lcu,
            ..Default::default()
        };

        if !dpb.is_empty() {
            slice.slice_type = SliceType::P;
            slice.num_ref_idx_l0_active_minus1 = (dpb.len() - 1) as u8;
            for (i, (frame, ref_poc)) in dpb.iter().rev().enumerate() {
                pic.ref_frame_list[i] = Some(CodecPicture::new(*frame));
                pic.ref_frame_poc_list[i] = *ref_poc;
                slice.ref_pic_list[0][i] = Some(i as u8);
            }
            pic.collocated_ref_pic_index = Some(0);
        }

        let slices = [slice];
        let input = PictureInput {
            seq: new_sequence.then_some(&seq),
            pic: &pic,
            slices: &slices,
            surfaces: PictureSurfaces {
                recon: Some(ResourceHandle(0x1000 + u32::from(recon.get()))),
                raw: Some(ResourceHandle(0x2000 + u32::from(recon.get()))),
                bitstream: Some(ResourceHandle(0x3000)),
                mb_code: None,
            },
        };

        match orchestrator.encode_picture(&input, &mut builder) {
            Ok(state) => {
                println!(
                    "#{:<3} {}x{} {:?}{} recon {:>2} refs {:?} buf {:>2} wait_pak {} signal_enc {} hme {} resized {}",
                    n,
                    state.geometry.frame_width,
                    state.geometry.frame_height,
                    state.coding_type,
                    if used_as_ref { "" } else { " (non-ref)" },
                    recon.get(),
                    state
                        .ref_map
                        .ref_list()
                        .iter()
                        .map(|f| f.get())
                        .collect::<Vec<_>>(),
                    state.tracked_buffer_index,
                    state.wait_for_pak,
                    state.signal_enc,
                    state.hme_enabled,
                    state.resolution_changed,
                );
            }
            Err(e) => {
                eprintln!("picture {} failed: {}", n, e);
                std::process::exit(1);
            }
        }
        new_sequence = false;

        if used_as_ref {
            dpb.push((recon, poc));
            if dpb.len() > num_refs {
                dpb.remove(0);
            }
        }
    }

    println!(
        "{} pictures built, {} live GPU resources, {} allocations",
        builder.pictures.len(),
        orchestrator.gpu().live_resources(),
        orchestrator.gpu().total_allocations()
    );
}
