#[cfg(test)]
mod animation_tests {
    use std::borrow::Cow;

    use gif::{ColorOutput, DecodeOptions, Encoder, Frame, Repeat};
    use img_compress_rs::{CompressionOptions, Compressor, EngineSettings, SizePolicy};

    const MIB: u64 = 1024 * 1024;

    /// A GIF whose frames each use a 64-color local palette.
    fn animated_gif(width: u16, height: u16, frames: usize, delay: u16) -> Vec<u8> {
        let mut output = Vec::new();
        {
            let mut encoder = Encoder::new(&mut output, width, height, &[]).expect("gif encoder");
            encoder.set_repeat(Repeat::Infinite).expect("repeat");

            for n in 0..frames {
                let palette: Vec<u8> = (0..64u8)
                    .flat_map(|i| [i * 4, (i * 4).wrapping_add(n as u8 * 5), 255 - i * 4])
                    .collect();
                let buffer: Vec<u8> = (0..usize::from(width) * usize::from(height))
                    .map(|p| ((p / usize::from(width) + p % usize::from(width) + n) % 64) as u8)
                    .collect();
                let frame = Frame {
                    width,
                    height,
                    delay,
                    palette: Some(palette),
                    buffer: Cow::Owned(buffer),
                    ..Frame::default()
                };
                encoder.write_frame(&frame).expect("write frame");
            }
        }
        output
    }

    struct Inspected {
        width: u16,
        height: u16,
        delays: Vec<u16>,
        max_palette: usize,
    }

    fn inspect(data: &[u8]) -> Inspected {
        let mut options = DecodeOptions::new();
        options.set_color_output(ColorOutput::Indexed);
        let mut decoder = options.read_info(data).expect("gif header");
        let global = decoder.global_palette().map(|p| p.len() / 3).unwrap_or(0);

        let mut delays = Vec::new();
        let mut max_palette = global;
        while let Some(frame) = decoder.read_next_frame().expect("gif frame") {
            delays.push(frame.delay);
            if let Some(palette) = &frame.palette {
                max_palette = max_palette.max(palette.len() / 3);
            }
        }

        Inspected {
            width: decoder.width(),
            height: decoder.height(),
            delays,
            max_palette,
        }
    }

    #[test]
    fn test_large_animation_pipeline() {
        let data = animated_gif(200, 150, 50, 10);
        let original_total: u32 = 50 * 10;

        // Declared as 3MB: auto-scale 0.7 and the 30% keep tier.
        let result = Compressor::default()
            .compress_with_size(&data, 3 * MIB, &CompressionOptions::default())
            .expect("compress");

        assert_eq!(result.info.format, "gif");
        assert!(result.info.is_animated);
        assert_eq!(result.info.frame_count, 15);
        assert_eq!((result.info.width, result.info.height), (140, 105));

        let output = inspect(&result.data);
        assert_eq!((output.width, output.height), (140, 105));
        assert_eq!(output.delays.len(), 15);
        assert!(output.max_palette <= 32, "palette of {} colors", output.max_palette);

        let total: u32 = output.delays.iter().map(|&d| u32::from(d)).sum();
        assert!(output.delays.iter().all(|&d| (2..=100).contains(&d)));
        assert!(original_total.abs_diff(total) <= 15, "{} vs {}", total, original_total);
    }

    #[test]
    fn test_explicit_limits_on_animation() {
        let data = animated_gif(100, 80, 4, 8);
        let options = CompressionOptions {
            max_width: 50,
            ..Default::default()
        };
        let result = Compressor::default().compress(&data, &options).expect("compress");

        assert_eq!((result.info.width, result.info.height), (50, 40));
        // Four frames is below the subsampling threshold.
        assert_eq!(result.info.frame_count, 4);
        assert_eq!(inspect(&result.data).delays, vec![8, 8, 8, 8]);
    }

    #[test]
    fn test_small_animation_never_grows() {
        let data = animated_gif(40, 30, 3, 20);
        let result = Compressor::default()
            .compress(&data, &CompressionOptions::default())
            .expect("compress");

        assert_eq!(result.info.format, "gif");
        assert!(result.info.compressed_size <= result.info.original_size);
        assert_eq!(result.info.frame_count, 3);
        assert_eq!((result.info.width, result.info.height), (40, 30));
    }

    #[test]
    fn test_strict_policy_on_animation() {
        let data = animated_gif(60, 40, 12, 5);
        let compressor = Compressor::new(EngineSettings {
            size_policy: SizePolicy::Strict,
            ..Default::default()
        });
        // Frames are dropped, but a one-byte original cannot be beaten.
        let result = compressor
            .compress_with_size(&data, 1, &CompressionOptions::default())
            .expect("compress");
        assert_eq!(result.data, data);
        assert_eq!(result.info.frame_count, 12);
        assert_eq!(result.info.ratio, 1.0);
    }

    #[test]
    fn test_animation_converted_to_static() {
        let data = animated_gif(32, 32, 6, 10);
        let options = CompressionOptions {
            output_format: img_compress_rs::OutputFormat::Png,
            ..Default::default()
        };
        let result = Compressor::default()
            .compress_with_size(&data, 10 * MIB, &options)
            .expect("compress");
        assert_eq!(result.info.format, "png");
        assert_eq!(result.info.frame_count, 1);
        assert!(!result.info.is_animated);
    }
}
