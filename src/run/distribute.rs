/// Share of `total` given to part `index` of `parts`: the floor of the even
/// split, plus one for each of the lowest `total % parts` indices. The
/// shares of all parts sum to `total`.
pub fn distribute(total: u64, parts: usize, index: usize) -> u64 {
    if parts == 0 {
        return 0;
    }
    let parts = parts as u64;
    let extra = ((index as u64) < total % parts) as u64;
    total / parts + extra
}
