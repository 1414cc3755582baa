//! End-to-end reassembly scenarios: sensor-order payload streams through
//! the assembler and pool, checked down to pixel positions.

use std::sync::Arc;

use uvc_capture::{BufferPool, FrameAssembler, FrameShape};
use uvc_proto::{PixelFormat, Roi, consts};

fn packet(fid: bool, eof: bool, data: &[u8]) -> Vec<u8> {
    let mut info = 0u8;
    if fid {
        info |= consts::HDR_FID;
    }
    if eof {
        info |= consts::HDR_EOF;
    }
    let mut out = vec![2, info];
    out.extend_from_slice(data);
    out
}

#[test]
fn test_software_crop_of_full_sensor_frame() {
    // 1280x960 16-bit sensor, 640x480 window at the origin.
    let pool = Arc::new(BufferPool::new());
    pool.reset(
        FrameShape {
            pixel_format: PixelFormat::Mono16,
            width: 1280,
            height: 960,
            bytes_per_line: 2560,
            bytes_per_pixel: 2,
        },
        Roi::full(1280, 960),
        4,
    );
    pool.set_roi(Roi {
        x: 0,
        y: 0,
        width: 640,
        height: 480,
    })
    .unwrap();

    let src: Vec<u8> = (0..1280usize * 960 * 2).map(|i| (i % 251) as u8).collect();

    let mut assembler = FrameAssembler::new(pool);
    let mut completed = Vec::new();
    let chunks: Vec<&[u8]> = src.chunks(4094).collect();
    let last = chunks.len() - 1;
    for (i, chunk) in chunks.into_iter().enumerate() {
        assembler.fill_frame(&packet(false, i == last, chunk), &mut completed);
    }

    assert!(!completed.is_empty());
    let out = &completed[0];

    // Exactly the window, nothing more.
    assert_eq!(out.data().len(), 640 * 480 * 2);
    assert!(out.is_full());

    // Pixel [0][0] is the source's pixel [0][0].
    assert_eq!(out.data()[0], src[0]);
    assert_eq!(out.data()[1], src[1]);

    // Spot-check an interior pixel: out (100, 200) == src (100, 200).
    let out_off = (200 * 640 + 100) * 2;
    let src_off = (200 * 1280 + 100) * 2;
    assert_eq!(out.data()[out_off], src[src_off]);
    assert_eq!(out.data()[out_off + 1], src[src_off + 1]);

    // Last window pixel comes from source row 479, column 639.
    let out_last = (479 * 640 + 639) * 2;
    let src_last = (479 * 1280 + 639) * 2;
    assert_eq!(out.data()[out_last], src[src_last]);
}

#[test]
fn test_offset_crop_across_two_frames() {
    // 8x4 sensor, 4x2 window at (2, 1); two frames with alternating
    // frame id and EOF on each frame's last payload.
    let pool = Arc::new(BufferPool::new());
    pool.reset(
        FrameShape {
            pixel_format: PixelFormat::Mono8,
            width: 8,
            height: 4,
            bytes_per_line: 8,
            bytes_per_pixel: 1,
        },
        Roi::full(8, 4),
        4,
    );
    pool.set_roi(Roi {
        x: 2,
        y: 1,
        width: 4,
        height: 2,
    })
    .unwrap();

    let frame_a: Vec<u8> = (0u8..32).collect();
    let frame_b: Vec<u8> = (100u8..132).collect();

    let mut assembler = FrameAssembler::new(pool);
    let mut completed = Vec::new();
    assembler.fill_frame(&packet(false, false, &frame_a[..20]), &mut completed);
    assembler.fill_frame(&packet(false, true, &frame_a[20..]), &mut completed);
    assembler.fill_frame(&packet(true, false, &frame_b[..20]), &mut completed);
    assembler.fill_frame(&packet(true, true, &frame_b[20..]), &mut completed);

    // Exactly two frames, no cross-frame bleed.
    assert_eq!(completed.len(), 2);
    assert_eq!(completed[0].data(), &[10, 11, 12, 13, 18, 19, 20, 21]);
    assert_eq!(
        completed[1].data(),
        &[110, 111, 112, 113, 118, 119, 120, 121]
    );
}

#[test]
fn test_hardware_cropped_stream_full_window() {
    // Device-cropped mode: the wire carries the window itself, so the
    // pool window covers the whole delivered frame.
    let pool = Arc::new(BufferPool::new());
    pool.reset(
        FrameShape {
            pixel_format: PixelFormat::Mono8,
            width: 4,
            height: 2,
            bytes_per_line: 4,
            bytes_per_pixel: 1,
        },
        Roi::full(4, 2),
        2,
    );

    let mut assembler = FrameAssembler::new(pool);
    let mut completed = Vec::new();
    assembler.fill_frame(&packet(false, true, &(0u8..8).collect::<Vec<_>>()), &mut completed);

    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].data(), &[0, 1, 2, 3, 4, 5, 6, 7]);
}
