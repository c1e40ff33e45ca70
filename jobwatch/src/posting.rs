/// A single job posting extracted from the board.
///
/// Two postings are considered the same announcement when they share a
/// `dedup_key`, regardless of cosmetic differences in the other fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posting {
    pub title: String,
    pub company: String,
    pub work_status: String,
    pub location: String,
    pub skills: Vec<String>,
    pub link: String,
}

impl Posting {
    /// The stable identity of a posting: the URL the board links to.
    ///
    /// Titles get re-worded and re-ordered between harvests, the apply
    /// link does not.
    pub fn dedup_key(&self) -> &str {
        &self.link
    }
}
