//! GEMM operation and memory descriptors
//!
//! The internal implementation is column-major; the public entry points
//! normalize the row-major calling convention before anything here runs.

use crate::dtype::ElementKind;
use crate::error::{Error, Result};

/// Transpose flag of one GEMM operand
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Transpose {
    /// Operand is used as stored
    NoTrans,
    /// Operand is used transposed
    Trans,
}

impl Transpose {
    /// Parse a BLAS-style transpose character.
    ///
    /// # Errors
    ///
    /// Only `'n'`, `'N'`, `'t'` and `'T'` are recognized.
    pub fn from_char(c: char) -> Result<Self> {
        match c {
            'n' | 'N' => Ok(Self::NoTrans),
            't' | 'T' => Ok(Self::Trans),
            _ => Err(Error::invalid_argument(
                "trans",
                format!("unrecognized transpose flag '{}'", c),
            )),
        }
    }

    /// True for the transposed form
    #[inline]
    pub fn is_trans(self) -> bool {
        matches!(self, Self::Trans)
    }
}

/// Operation descriptor for one matrix multiply
///
/// Captures everything the kernel-selection step needs: transpose flags,
/// dimensions, leading dimensions, scale factors and the element kind.
/// All dimensions are column-major.
#[derive(Clone, Debug)]
pub struct GemmDesc {
    /// Transpose flag for operand A
    pub transa: Transpose,
    /// Transpose flag for operand B
    pub transb: Transpose,
    /// Rows of op(A) and of C
    pub m: i64,
    /// Columns of op(B) and of C
    pub n: i64,
    /// Columns of op(A) and rows of op(B)
    pub k: i64,
    /// Leading dimension of A
    pub lda: i64,
    /// Leading dimension of B
    pub ldb: i64,
    /// Leading dimension of C
    pub ldc: i64,
    /// Scale applied to the product
    pub alpha: f32,
    /// Scale applied to the destination before accumulation
    pub beta: f32,
    /// Element kind of all three operands
    pub elem: ElementKind,
}

/// Validate shape and stride arguments of a column-major GEMM call.
///
/// # Errors
///
/// Fails with [`Error::InvalidArgument`] when a dimension is negative or a
/// leading dimension is below the minimum derived from the transpose flags.
#[allow(clippy::too_many_arguments)]
pub fn check_gemm_input(
    transa: Transpose,
    transb: Transpose,
    m: i64,
    n: i64,
    k: i64,
    lda: i64,
    ldb: i64,
    ldc: i64,
) -> Result<()> {
    if m < 0 || n < 0 || k < 0 {
        return Err(Error::invalid_argument(
            "m/n/k",
            format!("dimensions must be non-negative, got ({}, {}, {})", m, n, k),
        ));
    }

    let nrow_a = if transa.is_trans() { k } else { m };
    let nrow_b = if transb.is_trans() { n } else { k };
    if lda < nrow_a.max(1) {
        return Err(Error::invalid_argument(
            "lda",
            format!("leading dimension {} below minimum {}", lda, nrow_a.max(1)),
        ));
    }
    if ldb < nrow_b.max(1) {
        return Err(Error::invalid_argument(
            "ldb",
            format!("leading dimension {} below minimum {}", ldb, nrow_b.max(1)),
        ));
    }
    if ldc < m.max(1) {
        return Err(Error::invalid_argument(
            "ldc",
            format!("leading dimension {} below minimum {}", ldc, m.max(1)),
        ));
    }
    Ok(())
}

/// Byte-extent description of one GEMM operand
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryDesc {
    /// Stored rows (the leading-dimension axis)
    pub rows: i64,
    /// Stored columns
    pub cols: i64,
    /// Leading dimension in elements
    pub ld: i64,
    /// Element kind
    pub elem: ElementKind,
}

impl MemoryDesc {
    /// Total byte extent of the stored region: `ld * cols * sizeof(elem)`.
    pub fn size_bytes(&self) -> usize {
        (self.ld as usize) * (self.cols as usize) * self.elem.size_in_bytes()
    }
}

/// Index of operand A in [`gemm_memory_desc`]
pub const OPERAND_A: usize = 0;
/// Index of operand B in [`gemm_memory_desc`]
pub const OPERAND_B: usize = 1;
/// Index of operand C in [`gemm_memory_desc`]
pub const OPERAND_C: usize = 2;

/// Derive the memory descriptor of one operand from the operation
/// descriptor.
///
/// # Errors
///
/// Fails with [`Error::InvalidArgument`] for an unknown operand index.
pub fn gemm_memory_desc(desc: &GemmDesc, operand: usize) -> Result<MemoryDesc> {
    let (rows, cols, ld) = match operand {
        OPERAND_A => {
            if desc.transa.is_trans() {
                (desc.k, desc.m, desc.lda)
            } else {
                (desc.m, desc.k, desc.lda)
            }
        }
        OPERAND_B => {
            if desc.transb.is_trans() {
                (desc.n, desc.k, desc.ldb)
            } else {
                (desc.k, desc.n, desc.ldb)
            }
        }
        OPERAND_C => (desc.m, desc.n, desc.ldc),
        other => {
            return Err(Error::invalid_argument(
                "operand",
                format!("unknown GEMM operand index {}", other),
            ));
        }
    };
    Ok(MemoryDesc {
        rows,
        cols,
        ld,
        elem: desc.elem,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transpose_parsing() {
        assert_eq!(Transpose::from_char('n').unwrap(), Transpose::NoTrans);
        assert_eq!(Transpose::from_char('N').unwrap(), Transpose::NoTrans);
        assert_eq!(Transpose::from_char('t').unwrap(), Transpose::Trans);
        assert_eq!(Transpose::from_char('T').unwrap(), Transpose::Trans);
        assert!(Transpose::from_char('c').is_err());
        assert!(Transpose::from_char('x').is_err());
    }

    #[test]
    fn test_valid_gemm_input() {
        use Transpose::*;
        check_gemm_input(NoTrans, NoTrans, 4, 5, 6, 4, 6, 4).unwrap();
        // Transposed A raises the lda minimum to k.
        check_gemm_input(Trans, NoTrans, 4, 5, 6, 6, 6, 4).unwrap();
        // Degenerate but legal: zero extents with unit strides.
        check_gemm_input(NoTrans, NoTrans, 0, 0, 0, 1, 1, 1).unwrap();
    }

    #[test]
    fn test_negative_dimension_rejected() {
        use Transpose::*;
        assert!(check_gemm_input(NoTrans, NoTrans, -1, 5, 6, 4, 6, 4).is_err());
        assert!(check_gemm_input(NoTrans, NoTrans, 4, 5, -6, 4, 6, 4).is_err());
    }

    #[test]
    fn test_leading_dimension_minimums() {
        use Transpose::*;
        // lda must cover m rows when A is not transposed.
        assert!(check_gemm_input(NoTrans, NoTrans, 4, 5, 6, 3, 6, 4).is_err());
        // And k rows when it is.
        assert!(check_gemm_input(Trans, NoTrans, 4, 5, 6, 5, 6, 4).is_err());
        // ldb covers k rows untransposed, n rows transposed.
        assert!(check_gemm_input(NoTrans, NoTrans, 4, 5, 6, 4, 5, 4).is_err());
        assert!(check_gemm_input(NoTrans, Trans, 4, 5, 6, 4, 4, 4).is_err());
        // ldc always covers m.
        assert!(check_gemm_input(NoTrans, NoTrans, 4, 5, 6, 4, 6, 3).is_err());
    }

    fn desc(transa: Transpose, transb: Transpose) -> GemmDesc {
        GemmDesc {
            transa,
            transb,
            m: 4,
            n: 5,
            k: 6,
            lda: 8,
            ldb: 8,
            ldc: 8,
            alpha: 1.0,
            beta: 0.0,
            elem: ElementKind::F32,
        }
    }

    #[test]
    fn test_operand_descriptors() {
        use Transpose::*;
        let d = desc(NoTrans, NoTrans);
        let a = gemm_memory_desc(&d, OPERAND_A).unwrap();
        assert_eq!((a.rows, a.cols, a.ld), (4, 6, 8));
        let b = gemm_memory_desc(&d, OPERAND_B).unwrap();
        assert_eq!((b.rows, b.cols, b.ld), (6, 5, 8));
        let c = gemm_memory_desc(&d, OPERAND_C).unwrap();
        assert_eq!((c.rows, c.cols, c.ld), (4, 5, 8));

        let d = desc(Trans, Trans);
        let a = gemm_memory_desc(&d, OPERAND_A).unwrap();
        assert_eq!((a.rows, a.cols), (6, 4));
        let b = gemm_memory_desc(&d, OPERAND_B).unwrap();
        assert_eq!((b.rows, b.cols), (5, 6));

        assert!(gemm_memory_desc(&d, 3).is_err());
    }

    #[test]
    fn test_memory_desc_byte_size() {
        let d = desc(Transpose::NoTrans, Transpose::NoTrans);
        let a = gemm_memory_desc(&d, OPERAND_A).unwrap();
        // ld * cols * sizeof(f32)
        assert_eq!(a.size_bytes(), 8 * 6 * 4);

        let mut half = d.clone();
        half.elem = ElementKind::F16;
        let a = gemm_memory_desc(&half, OPERAND_A).unwrap();
        assert_eq!(a.size_bytes(), 8 * 6 * 2);
    }
}
