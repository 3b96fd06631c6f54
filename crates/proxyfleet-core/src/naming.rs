/// Login account used when the image is not in [`KNOWN_IMAGE_USERS`].
pub const DEFAULT_LOGIN_USER: &str = "ec2-user";

/// Images whose login account differs from the default.
pub const KNOWN_IMAGE_USERS: &[(&str, &str)] = &[
    // Debian
    ("ami-9cc0d5f8", "admin"),
];

/// Resolve the SSH login account for an image identifier.
pub fn login_user_for_image(image_id: &str) -> &'static str {
    KNOWN_IMAGE_USERS
        .iter()
        .find(|(image, _)| *image == image_id)
        .map(|(_, user)| *user)
        .unwrap_or(DEFAULT_LOGIN_USER)
}

/// Loopback bind address for a tunnel's dynamic forward.
pub fn socks_bind(port: u16) -> String {
    format!("127.0.0.1:{}", port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debian_image_uses_admin() {
        assert_eq!(login_user_for_image("ami-9cc0d5f8"), "admin");
    }

    #[test]
    fn test_unknown_image_uses_default() {
        assert_eq!(login_user_for_image("ami-00000000"), DEFAULT_LOGIN_USER);
        assert_eq!(login_user_for_image(""), DEFAULT_LOGIN_USER);
    }

    #[test]
    fn test_socks_bind() {
        assert_eq!(socks_bind(8080), "127.0.0.1:8080");
    }
}
