#![allow(clippy::module_name_repetitions)]
//! Pretty printing of matrices and vectors. Useful for debugging the contents
//! of an information matrix or a stacked Jacobian.

use crate::{Float, Matrix, Vector};

const PRECISION: usize = 3;

const RESET_TEXT: &str = "\x1b[0m";
const RED_TEXT: &str = "\x1b[31m";
const GREEN_TEXT: &str = "\x1b[32m";
const YELLOW_TEXT: &str = "\x1b[33m";
const MAGENTA_TEXT: &str = "\x1b[35m";
const CYAN_TEXT: &str = "\x1b[36m";

const BAR: char = '│';
const UPPER_LEFT_CORNER: char = '╭';
const UPPER_RIGHT_CORNER: char = '╮';
const LOWER_LEFT_CORNER: char = '╰';
const LOWER_RIGHT_CORNER: char = '╯';

/// Count the number of integral digits in a floating point number, sign
/// included. Used to size the cells when pretty printing.
#[must_use]
pub fn num_of_integral_digits(mut f: f64) -> Option<usize> {
    if f.is_nan() || f.is_infinite() {
        return None;
    }

    let mut count = 0_usize;
    if f.is_sign_negative() {
        f = -f;
        count += 1;
    }
    if f < 1.0 {
        count += 1;
    }
    while f >= 1.0 {
        f /= 10.0;
        count += 1;
    }
    Some(count)
}

/// Map a floating point number to an ansi color string.
fn float_color(f: Float) -> &'static str {
    if f.is_nan() {
        MAGENTA_TEXT
    } else if f.is_infinite() {
        YELLOW_TEXT
    } else if f.is_sign_negative() {
        RED_TEXT
    } else if f > 0.0 {
        GREEN_TEXT
    } else {
        RESET_TEXT
    }
}

fn cell_width_of(values: impl Iterator<Item = Float>) -> usize {
    let mut max_width = 0;
    for v in values {
        let width = num_of_integral_digits(v).unwrap_or(0) + 1;
        max_width = max_width.max(width);
    }
    if max_width == 0 {
        max_width = 5; // enough for "nan", "inf" and "-inf"
    }
    max_width + 1 + PRECISION
}

/// Pretty print a matrix. Not intended to be used directly; use the
/// [`pretty_print_matrix!`](crate::pretty_print_matrix) macro instead.
pub fn _pretty_print_matrix(matrix: &Matrix, name: Option<&str>, file: &str, line: u32) {
    let (nrows, ncols) = matrix.shape();
    let cell_width = cell_width_of(matrix.iter().copied());
    let total_width = ncols * cell_width + cell_width / 2;
    let horizontal_line = "─".repeat(total_width);

    println!("{file}:{YELLOW_TEXT}{line}{RESET_TEXT}");
    if let Some(name) = name {
        println!("{CYAN_TEXT}{name}{RESET_TEXT}:{MAGENTA_TEXT}{nrows}x{ncols}{RESET_TEXT}");
    }
    println!("{UPPER_LEFT_CORNER}{horizontal_line}{UPPER_RIGHT_CORNER}");
    for i in 0..nrows {
        print!("{BAR} ");
        for j in 0..ncols {
            let v = matrix[(i, j)];
            print!(
                "{}{:>width$.precision$}{} ",
                float_color(v),
                v,
                RESET_TEXT,
                width = cell_width - 1,
                precision = PRECISION
            );
        }
        println!("{BAR}");
    }
    println!("{LOWER_LEFT_CORNER}{horizontal_line}{LOWER_RIGHT_CORNER}");
}

/// Pretty print a vector as a single row. Not intended to be used directly;
/// use the [`pretty_print_vector!`](crate::pretty_print_vector) macro instead.
pub fn _pretty_print_vector(vector: &Vector, name: Option<&str>, file: &str, line: u32) {
    let matrix = Matrix::from_row_slice(1, vector.len(), vector.as_slice());
    _pretty_print_matrix(&matrix, name, file, line);
}

/// Print a matrix with its expression name and call site.
#[macro_export]
macro_rules! pretty_print_matrix {
    ($matrix:expr) => {
        $crate::pretty_print::_pretty_print_matrix(
            &$matrix,
            Some(stringify!($matrix)),
            file!(),
            line!(),
        )
    };
}

/// Print a vector with its expression name and call site.
#[macro_export]
macro_rules! pretty_print_vector {
    ($vector:expr) => {
        $crate::pretty_print::_pretty_print_vector(
            &$vector,
            Some(stringify!($vector)),
            file!(),
            line!(),
        )
    };
}
