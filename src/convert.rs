//! Conversions between the application sample format and the link format

use crate::{
    config::{LinkFormat, SampleFormat},
    Complex16, Complex32,
};

/// Bits to shift an application integer left to reach link scale.
/// Negative means a right shift.
fn link_shift(format: SampleFormat, link: LinkFormat) -> i32 {
    match (format, link) {
        (SampleFormat::Int16, LinkFormat::Int12) => -4,
        (SampleFormat::Int12, LinkFormat::Int16) => 4,
        _ => 0,
    }
}

/// True when integer samples go to the wire unchanged
pub fn is_passthrough(format: SampleFormat, link: LinkFormat) -> bool {
    format != SampleFormat::Float32 && link_shift(format, link) == 0
}

fn shift(sample: Complex16, bits: i32) -> Complex16 {
    match bits {
        0 => sample,
        b if b > 0 => Complex16::new(sample.re << b, sample.im << b),
        b => Complex16::new(sample.re >> -b, sample.im >> -b),
    }
}

/// Integer application samples to link scale, `dst` must be as long as `src`
pub fn int_to_link(src: &[Complex16], format: SampleFormat, link: LinkFormat, dst: &mut [Complex16]) {
    let bits = link_shift(format, link);
    for (out, sample) in dst.iter_mut().zip(src) {
        *out = shift(*sample, bits);
    }
}

/// Link scale samples back to the application's integer format, in place
pub fn link_to_int(samples: &mut [Complex16], format: SampleFormat, link: LinkFormat) {
    let bits = -link_shift(format, link);
    if bits == 0 {
        return;
    }
    for sample in samples.iter_mut() {
        *sample = shift(*sample, bits);
    }
}

/// Normalized floats to link scale. Out of range values saturate.
pub fn float_to_link(src: &[Complex32], link: LinkFormat, dst: &mut [Complex16]) {
    let scale = link.full_scale();
    for (out, sample) in dst.iter_mut().zip(src) {
        *out = Complex16::new((sample.re * scale) as i16, (sample.im * scale) as i16);
    }
}

pub fn link_to_float(src: &[Complex16], link: LinkFormat, dst: &mut [Complex32]) {
    let scale = link.full_scale();
    for (out, sample) in dst.iter_mut().zip(src) {
        *out = Complex32::new(f32::from(sample.re) / scale, f32::from(sample.im) / scale);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::Zero;

    const VALUES: [f32; 4] = [-1.0, 0.0, 0.5, 0.999];

    #[test]
    fn floats_survive_within_one_step() {
        for link in [LinkFormat::Int12, LinkFormat::Int16] {
            let src: Vec<Complex32> = VALUES.iter().map(|v| Complex32::new(*v, -*v)).collect();
            let mut wire = vec![Complex16::zero(); src.len()];
            let mut back = vec![Complex32::zero(); src.len()];
            float_to_link(&src, link, &mut wire);
            link_to_float(&wire, link, &mut back);
            let step = 1.0 / link.full_scale();
            for (a, b) in src.iter().zip(&back) {
                assert!((a.re - b.re).abs() <= step, "{link}: {a} -> {b}");
                assert!((a.im - b.im).abs() <= step, "{link}: {a} -> {b}");
            }
        }
    }

    #[test]
    fn int16_on_packed_link_drops_four_bits() {
        let src = [Complex16::new(32767, -32768), Complex16::new(16, -16)];
        let mut wire = [Complex16::zero(); 2];
        int_to_link(&src, SampleFormat::Int16, LinkFormat::Int12, &mut wire);
        assert_eq!(wire, [Complex16::new(2047, -2048), Complex16::new(1, -1)]);

        link_to_int(&mut wire, SampleFormat::Int16, LinkFormat::Int12);
        assert_eq!(wire, [Complex16::new(32752, -32768), Complex16::new(16, -16)]);
    }

    #[test]
    fn int12_on_wide_link_gains_four_bits() {
        let src = [Complex16::new(2047, -2048)];
        let mut wire = [Complex16::zero(); 1];
        int_to_link(&src, SampleFormat::Int12, LinkFormat::Int16, &mut wire);
        assert_eq!(wire[0], Complex16::new(32752, -32768));
        link_to_int(&mut wire, SampleFormat::Int12, LinkFormat::Int16);
        assert_eq!(wire[0], src[0]);
    }

    #[test]
    fn matching_formats_pass_through() {
        let mut samples = [Complex16::new(1234, -4321)];
        link_to_int(&mut samples, SampleFormat::Int16, LinkFormat::Int16);
        assert_eq!(samples[0], Complex16::new(1234, -4321));
        assert!(is_passthrough(SampleFormat::Int12, LinkFormat::Int12));
        assert!(!is_passthrough(SampleFormat::Int16, LinkFormat::Int12));
        assert!(!is_passthrough(SampleFormat::Float32, LinkFormat::Int16));
    }

    #[test]
    fn floats_saturate() {
        let mut wire = [Complex16::zero(); 1];
        float_to_link(&[Complex32::new(2.0, -2.0)], LinkFormat::Int16, &mut wire);
        assert_eq!(wire[0], Complex16::new(32767, -32768));
    }
}
