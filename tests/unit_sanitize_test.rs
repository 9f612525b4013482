use timbre::core::sanitize::{TextRejection, clean_text_message};

#[test]
fn test_plain_text_passes_through() {
    assert_eq!(
        clean_text_message("hello", true, 100, 1000).unwrap(),
        "hello"
    );
}

#[test]
fn test_tags_are_stripped_when_html_disallowed() {
    assert_eq!(
        clean_text_message("<b>bold</b> and <i>italic</i>", false, 100, 1000).unwrap(),
        "bold and italic"
    );
    assert_eq!(
        clean_text_message("<a href=\"x\">link", false, 100, 1000).unwrap(),
        "link"
    );
}

#[test]
fn test_unterminated_tag_swallows_the_rest() {
    assert_eq!(
        clean_text_message("before <script junk", false, 100, 1000).unwrap(),
        "before "
    );
}

#[test]
fn test_html_preserved_when_allowed() {
    assert_eq!(
        clean_text_message("<b>x</b>", true, 100, 1000).unwrap(),
        "<b>x</b>"
    );
}

#[test]
fn test_length_limit() {
    let long = "x".repeat(101);
    assert_eq!(
        clean_text_message(&long, true, 100, 1000),
        Err(TextRejection::TooLong)
    );
    // Zero disables the check.
    assert!(clean_text_message(&long, true, 0, 0).is_ok());
}

#[test]
fn test_image_messages_use_the_image_limit() {
    let image = format!("<img src=\"data:image/png;base64,{}\">", "A".repeat(200));
    assert!(image.len() > 100);
    assert!(clean_text_message(&image, true, 100, 1000).is_ok());
    assert_eq!(
        clean_text_message(&image, true, 100, 150),
        Err(TextRejection::TooLong)
    );
}
