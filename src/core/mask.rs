use crate::types::{Nodata, ValidityMask};
use ndarray::{Array2, ArrayBase, Data, Ix2, Zip};
use num_traits::Float;

/// Build the stack-wide exclusion mask.
///
/// A pixel is flagged when it matches the sentinel in any band, so every band
/// pair is reduced over the same set of pixels. Without a sentinel nothing is
/// excluded.
pub fn build_mask<S, T>(bands: &[ArrayBase<S, Ix2>], nodata: Option<Nodata>) -> ValidityMask
where
    S: Data<Elem = T>,
    T: Float,
{
    let shape = match bands.first() {
        Some(band) => band.dim(),
        None => return Array2::from_elem((0, 0), false),
    };
    let mut mask = Array2::from_elem(shape, false);

    let nodata = match nodata {
        Some(nodata) => nodata,
        None => return mask,
    };

    for band in bands {
        Zip::from(&mut mask).and(band).for_each(|m, &v| {
            if !*m && nodata.matches(v) {
                *m = true;
            }
        });
    }

    mask
}

/// Number of pixels left for statistics
pub fn valid_count(mask: &ValidityMask) -> usize {
    mask.iter().filter(|&&invalid| !invalid).count()
}
