// src/visualisation.rs
//
// PNG plots for run output: per-lattice average magnetisation, total energy
// per lattice, and an m_z map of one z-slice.

use crate::grid::Grid3D;
use plotters::prelude::*;

/// Blue-white-red colour for m_z using a local min/max, so small variations
/// stay visible.
fn mz_to_color(mz: f64, min_mz: f64, max_mz: f64) -> RGBColor {
    let mut lo = min_mz;
    let mut hi = max_mz;
    if !lo.is_finite() || !hi.is_finite() || (hi - lo).abs() < 1e-9 {
        lo = -1.0;
        hi = 1.0;
    }

    let x = ((mz - lo) / (hi - lo)).clamp(0.0, 1.0);
    let r = (255.0 * x) as u8;
    let b = (255.0 * (1.0 - x)) as u8;
    let g = (255.0 * (1.0 - (2.0 * (x - 0.5).abs()))).clamp(0.0, 255.0) as u8;

    RGBColor(r, g, b)
}

/// Finite min/max of `values` with a 10% margin. Degenerate ranges are widened.
fn padded_range<'a>(values: impl Iterator<Item = &'a f64>) -> (f64, f64) {
    let mut y_min = f64::INFINITY;
    let mut y_max = f64::NEG_INFINITY;
    for &v in values {
        if v.is_finite() {
            y_min = y_min.min(v);
            y_max = y_max.max(v);
        }
    }

    if !y_min.is_finite() || !y_max.is_finite() {
        (-1.0, 1.0)
    } else if (y_max - y_min).abs() < 1e-30 {
        let delta = if y_max.abs() < 1e-30 { 1.0 } else { 0.1 * y_max.abs() };
        (y_min - delta, y_max + delta)
    } else {
        let margin = 0.1 * (y_max - y_min);
        (y_min - margin, y_max + margin)
    }
}

/// Time axis range; a single sample gets a unit-width window.
fn time_range(times: &[f64]) -> Option<(f64, f64)> {
    let (first, last) = (*times.first()?, *times.last()?);
    if last > first {
        Some((first, last))
    } else {
        Some((first, first + 1e-12))
    }
}

/// Average magnetisation of both lattices vs time. Lattice 1 is drawn solid,
/// lattice 2 in faded colours.
pub fn save_lattice_m_avg_plot(
    times: &[f64],
    m1: &[[f64; 3]],
    m2: &[[f64; 3]],
    filename: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let Some((t_min, t_max)) = time_range(times) else {
        return Ok(());
    };

    let root = BitMapBackend::new(filename, (1024, 768)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .margin(20)
        .caption("Average sublattice magnetisation vs time", ("sans-serif", 30))
        .set_left_and_bottom_label_area_size(60)
        .build_cartesian_2d(t_min..t_max, -1.1..1.1)?;

    chart
        .configure_mesh()
        .x_desc("time (s)")
        .y_desc("average m component")
        .draw()?;

    let colours = [RED, GREEN, BLUE];
    let names = ["x", "y", "z"];
    for (lattice, (series, fade)) in [(m1, 1.0), (m2, 0.45)].into_iter().enumerate() {
        for c in 0..3 {
            let colour = colours[c].mix(fade);
            chart
                .draw_series(LineSeries::new(
                    times.iter().zip(series.iter()).map(move |(&t, m)| (t, m[c])),
                    &colour,
                ))?
                .label(format!("m{}_{}", lattice + 1, names[c]))
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &colour));
        }
    }

    chart
        .configure_series_labels()
        .border_style(&BLACK)
        .background_style(&WHITE.mix(0.8))
        .draw()?;

    root.present()?;
    Ok(())
}

/// Total energy of each lattice and their sum vs time (J).
pub fn save_energy_plot(
    times: &[f64],
    e1: &[f64],
    e2: &[f64],
    filename: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let Some((t_min, t_max)) = time_range(times) else {
        return Ok(());
    };
    let e_sum: Vec<f64> = e1.iter().zip(e2).map(|(a, b)| a + b).collect();
    let (y_min, y_max) = padded_range(e1.iter().chain(e2).chain(&e_sum));

    // 10^n scaling for readable ticks.
    let magnitude = y_max.abs().max(y_min.abs());
    let (scale, y_label) = if magnitude > 0.0 {
        let exp = magnitude.log10().floor() as i32;
        if exp == 0 {
            (1.0, "Energy (J)".to_string())
        } else {
            (10f64.powi(exp), format!("Energy (J × 10^{})", exp))
        }
    } else {
        (1.0, "Energy (J)".to_string())
    };

    let root = BitMapBackend::new(filename, (1024, 768)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .margin(20)
        .caption("Sublattice energy vs time", ("sans-serif", 30))
        .set_left_and_bottom_label_area_size(60)
        .build_cartesian_2d(t_min..t_max, (y_min / scale)..(y_max / scale))?;

    chart
        .configure_mesh()
        .x_desc("time (s)")
        .y_desc(y_label)
        .x_labels(10)
        .y_labels(10)
        .label_style(("sans-serif", 16))
        .axis_desc_style(("sans-serif", 18))
        .draw()?;

    for (label, series, colour) in [("Lattice 1", e1, RED), ("Lattice 2", e2, BLUE), ("Total", &e_sum[..], BLACK)] {
        chart
            .draw_series(LineSeries::new(
                times.iter().zip(series.iter()).map(|(&t, &e)| (t, e / scale)),
                &colour,
            ))?
            .label(label)
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &colour));
    }

    chart
        .configure_series_labels()
        .border_style(&BLACK)
        .background_style(&WHITE.mix(0.8))
        .draw()?;

    root.present()?;
    Ok(())
}

/// One scalar channel vs time (max spin angle, max dm/dt, ...).
pub fn save_scalar_series_plot(
    times: &[f64],
    values: &[f64],
    caption: &str,
    y_desc: &str,
    filename: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let Some((t_min, t_max)) = time_range(times) else {
        return Ok(());
    };
    let (y_min, y_max) = padded_range(values.iter());

    let root = BitMapBackend::new(filename, (1024, 768)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .margin(20)
        .caption(caption, ("sans-serif", 30))
        .set_left_and_bottom_label_area_size(60)
        .build_cartesian_2d(t_min..t_max, y_min..y_max)?;

    chart.configure_mesh().x_desc("time (s)").y_desc(y_desc).draw()?;

    chart.draw_series(LineSeries::new(
        times.iter().zip(values.iter()).map(|(&t, &v)| (t, v)),
        &BLACK,
    ))?;

    root.present()?;
    Ok(())
}

/// m_z map of the z-slice `k` (cell indices on both axes).
pub fn save_mz_slice_plot(
    grid: &Grid3D,
    spin: &[[f64; 3]],
    k: usize,
    filename: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    if k >= grid.nz {
        return Err(format!("slice {} outside mesh with nz = {}", k, grid.nz).into());
    }
    if spin.len() != grid.n_cells() {
        return Err(format!("{} spins for a mesh of {} cells", spin.len(), grid.n_cells()).into());
    }
    let nx = grid.nx as i32;
    let ny = grid.ny as i32;

    let slice_mz = |i: i32, j: i32| spin[grid.idx(i as usize, j as usize, k)][2];
    let mut min_mz = f64::INFINITY;
    let mut max_mz = f64::NEG_INFINITY;
    for j in 0..ny {
        for i in 0..nx {
            let mz = slice_mz(i, j);
            if mz.is_finite() {
                min_mz = min_mz.min(mz);
                max_mz = max_mz.max(mz);
            }
        }
    }

    let root = BitMapBackend::new(filename, (800, 800)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .margin(40)
        .caption(
            format!("m_z, slice k = {} (blue = min, white = mid, red = max)", k),
            ("sans-serif", 20),
        )
        .x_label_area_size(40)
        .y_label_area_size(40)
        .build_cartesian_2d(0..nx, 0..ny)?;

    chart
        .configure_mesh()
        .x_desc("x (cell index)")
        .y_desc("y (cell index)")
        .axis_desc_style(("sans-serif", 15))
        .draw()?;

    chart.draw_series((0..nx).flat_map(|i| {
        (0..ny).map(move |j| {
            let color = mz_to_color(slice_mz(i, j), min_mz, max_mz);
            Rectangle::new([(i, j), (i + 1, j + 1)], color.filled())
        })
    }))?;

    root.present()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colour_map_ends() {
        assert_eq!(mz_to_color(-1.0, -1.0, 1.0), RGBColor(0, 0, 255));
        assert_eq!(mz_to_color(1.0, -1.0, 1.0), RGBColor(255, 0, 0));
        // Flat frame falls back to [-1, 1].
        assert_eq!(mz_to_color(1.0, 0.5, 0.5), RGBColor(255, 0, 0));
    }

    #[test]
    fn ranges_are_padded() {
        let (lo, hi) = padded_range([0.0, 10.0].iter());
        assert_eq!((lo, hi), (-1.0, 11.0));
        let (lo, hi) = padded_range([f64::NAN].iter());
        assert_eq!((lo, hi), (-1.0, 1.0));
        assert!(time_range(&[]).is_none());
        assert_eq!(time_range(&[2.0]), Some((2.0, 2.0 + 1e-12)));
    }

    #[test]
    fn slice_plot_checks_its_inputs() {
        let g = Grid3D::new(2, 2, 1, 1.0, 1.0, 1.0).unwrap();
        let spin = vec![[0.0, 0.0, 1.0]; 4];
        let err = save_mz_slice_plot(&g, &spin, 1, "unused.png").unwrap_err();
        assert!(err.to_string().contains("outside mesh"));
        let err = save_mz_slice_plot(&g, &spin[..3], 0, "unused.png").unwrap_err();
        assert!(err.to_string().contains("3 spins"));
    }
}
