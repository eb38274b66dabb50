//! Address header parsing.

use mailparse::MailAddr;

use crate::domain::Address;

/// Parses an address-list header value such as `"Ann" <a@x.com>, b@y.com`.
///
/// Group syntax is flattened. Values that fail to parse are kept verbatim as
/// a single address so nothing is silently lost.
pub fn parse_address_list(value: &str) -> Vec<Address> {
    let value = value.trim();
    if value.is_empty() {
        return Vec::new();
    }

    match mailparse::addrparse(value) {
        Ok(list) => list
            .iter()
            .flat_map(|addr| match addr {
                MailAddr::Single(single) => vec![single.clone()],
                MailAddr::Group(group) => group.addrs.clone(),
            })
            .map(|single| Address {
                email: single.addr,
                name: single.display_name.filter(|name| !name.trim().is_empty()),
            })
            .collect(),
        Err(e) => {
            tracing::debug!(error = %e, "unparseable address header, keeping raw value");
            vec![Address::new(value)]
        }
    }
}

/// Parses a single-address header, falling back to [`Address::unknown`].
pub fn parse_address(value: &str) -> Address {
    parse_address_list(value)
        .into_iter()
        .next()
        .unwrap_or_else(Address::unknown)
}
