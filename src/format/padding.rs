// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use num_traits::PrimInt;

/// Calculate the amount of padding that needs to be added to align the
/// specified offset to a page boundary.
pub fn calc<N: PrimInt>(offset: N, page_size: N) -> N {
    let r = offset % page_size;
    if r == N::zero() {
        N::zero()
    } else {
        page_size - r
    }
}

/// Round to the next multiple of the page size.
pub fn round<N: PrimInt>(offset: N, page_size: N) -> Option<N> {
    let remain = calc(offset, page_size);
    offset.checked_add(&remain)
}

#[cfg(test)]
mod tests {
    use super::{calc, round};

    #[test]
    fn page_alignment() {
        assert_eq!(calc(0u32, 2048), 0);
        assert_eq!(calc(1u32, 2048), 2047);
        assert_eq!(calc(2048u32, 2048), 0);
        assert_eq!(calc(2049u32, 2048), 2047);

        assert_eq!(round(0u32, 2048), Some(0));
        assert_eq!(round(1u32, 2048), Some(2048));
        assert_eq!(round(4097u32, 2048), Some(6144));
        assert_eq!(round(u32::MAX, 2048), None);
    }
}
