/// Conversion factor from amu/Å³ to g/cm³.
const AMU_PER_A3_TO_G_PER_CM3: f64 = 1.66054;

/// Volume of a triclinic cell from edge lengths (Å) and angles (degrees).
///
/// Degenerate (flat) cells clamp to zero instead of producing NaN from a
/// negative square-root argument.
pub fn cell_volume(lengths: [f64; 3], angles: [f64; 3]) -> f64 {
    let [a, b, c] = lengths;
    let [alpha, beta, gamma] = angles.map(f64::to_radians);

    let (ca, cb, cg) = (alpha.cos(), beta.cos(), gamma.cos());
    let term = 1.0 - ca * ca - cb * cb - cg * cg + 2.0 * ca * cb * cg;
    if term < 0.0 {
        return 0.0;
    }
    a * b * c * term.sqrt()
}

/// Mass density in g/cm³ from a total mass in amu and a cell volume in Å³.
pub fn density_g_per_cm3(total_mass_amu: f64, volume_a3: f64) -> Option<f64> {
    if volume_a3 > 0.0 {
        Some(total_mass_amu / volume_a3 * AMU_PER_A3_TO_G_PER_CM3)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orthorhombic_volume_is_edge_product() {
        let v = cell_volume([10.0, 20.0, 30.0], [90.0, 90.0, 90.0]);
        assert!((v - 6000.0).abs() < 1e-9);
    }

    #[test]
    fn truncated_octahedron_volume_is_reduced() {
        // The 109.47° box used by AMBER's solvateoct.
        let v = cell_volume([60.0, 60.0, 60.0], [109.4712190, 109.4712190, 109.4712190]);
        let cube = 60.0f64.powi(3);
        assert!(v < cube);
        assert!((v / cube - 0.7698).abs() < 1e-3);
    }

    #[test]
    fn degenerate_cell_clamps_to_zero() {
        assert_eq!(cell_volume([10.0, 10.0, 10.0], [0.0, 90.0, 90.0]), 0.0);
    }

    #[test]
    fn density_converts_units() {
        // TIP3P-ish: 1 g/cm³ of water is ~0.6022 amu/Å³.
        let d = density_g_per_cm3(18.015 * 1000.0, 29_915.0).unwrap();
        assert!((d - 1.0).abs() < 2e-3);
    }

    #[test]
    fn density_is_absent_without_a_volume() {
        assert_eq!(density_g_per_cm3(100.0, 0.0), None);
    }
}
