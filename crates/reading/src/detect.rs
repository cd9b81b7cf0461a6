use crate::Reading;

/// Whether `candidate` is a publication the caller has not seen yet.
///
/// Only the date-of-record and the primary value take part; secondary
/// currencies and capture time are ignored. Values are compared exactly.
pub fn is_new(previous: Option<&Reading>, candidate: &Reading) -> bool {
    match previous {
        None => true,
        Some(prev) => {
            prev.date_of_record != candidate.date_of_record || prev.primary() != candidate.primary()
        }
    }
}
