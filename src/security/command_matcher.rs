/// Returns true when `command` is on the approved list, either verbatim or by
/// sharing its first whitespace-delimited token with an approved entry.
///
/// Only the first token is compared, so an approved `git status` also admits
/// `git push --force`. The list approves command families, not exact
/// invocations.
pub fn is_approved(command: &str, approved: &[String]) -> bool {
    let command = command.trim();
    if command.is_empty() {
        return false;
    }
    let head = first_token(command);
    approved.iter().any(|entry| {
        let entry = entry.trim();
        entry == command || (!entry.is_empty() && first_token(entry) == head)
    })
}

pub fn first_token(command: &str) -> &str {
    command.split_whitespace().next().unwrap_or_default()
}
