/// Split a comma separated header value into its mailboxes.
///
/// Fragments are trimmed and kept in order. Duplicates are kept. No mailbox
/// syntax is checked here; the directory API rejects what it cannot deliver
/// to. Empty or whitespace-only input gives an empty list, never `[""]`.
///
/// ```
/// use graph_smtpd_core::parse_address_list;
///
/// assert!(parse_address_list("").is_empty());
/// assert_eq!(
///     parse_address_list(" a@x.com , b@y.com "),
///     vec!["a@x.com", "b@y.com"]
/// );
/// ```
pub fn parse_address_list(raw: &str) -> Vec<String> {
    if raw.trim().is_empty() {
        return Vec::new();
    }

    raw.split(',').map(|address| address.trim().to_string()).collect()
}
