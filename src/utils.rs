/// `map_range(x, in_min, in_max, out_min, out_max)` maps `x` from one integer range onto another
///
/// Behaves like the classic Arduino `map()`: the input is not clamped, and an
/// empty input range is undefined.
pub fn map_range(x: i32, in_min: i32, in_max: i32, out_min: i32, out_max: i32) -> i32 {
    (x - in_min) * (out_max - out_min) / (in_max - in_min) + out_min
}

/// `is_almost(v1, v2, e)` is true iff `v1` is within `e` of `v2`
pub fn is_almost(v1: f32, v2: f32, eps: f32) -> bool {
    fabs(v1 - v2) <= eps
}

/// `fabs(v)` is the absolute value of `v`
pub fn fabs(v: f32) -> f32 {
    if v < 0.0 {
        -v
    } else {
        v
    }
}
