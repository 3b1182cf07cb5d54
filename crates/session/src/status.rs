//! Mapping between OBEX response codes and share statuses.

use opush_obex::ResponseCode;
use opush_share::ShareStatus;

/// Status of an outbound share the peer refused with `code`.
pub fn status_for_response(code: ResponseCode) -> ShareStatus {
    match code {
        ResponseCode::OK | ResponseCode::CONTINUE => ShareStatus::Success,
        ResponseCode::FORBIDDEN | ResponseCode::UNAUTHORIZED => ShareStatus::Forbidden,
        ResponseCode::NOT_ACCEPTABLE | ResponseCode::UNSUPPORTED_MEDIA_TYPE => {
            ShareStatus::NotAcceptable
        }
        ResponseCode::LENGTH_REQUIRED => ShareStatus::LengthRequired,
        ResponseCode::BAD_REQUEST => ShareStatus::BadRequest,
        _ => ShareStatus::UnhandledProtocolCode,
    }
}

/// Response sent to a pushing peer when a receive fails with `status`.
pub fn response_for_status(status: ShareStatus) -> ResponseCode {
    match status {
        ShareStatus::Success => ResponseCode::OK,
        ShareStatus::BadRequest => ResponseCode::BAD_REQUEST,
        ShareStatus::LengthRequired => ResponseCode::LENGTH_REQUIRED,
        ShareStatus::Forbidden | ShareStatus::Canceled => ResponseCode::FORBIDDEN,
        ShareStatus::NotAcceptable => ResponseCode::UNSUPPORTED_MEDIA_TYPE,
        ShareStatus::StorageFull | ShareStatus::NoStorage => ResponseCode::DATABASE_FULL,
        _ => ResponseCode::INTERNAL_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_refusals() {
        assert_eq!(
            status_for_response(ResponseCode::FORBIDDEN),
            ShareStatus::Forbidden
        );
        assert_eq!(
            status_for_response(ResponseCode::UNSUPPORTED_MEDIA_TYPE),
            ShareStatus::NotAcceptable
        );
        assert_eq!(
            status_for_response(ResponseCode(0xE5)),
            ShareStatus::UnhandledProtocolCode
        );
    }

    #[test]
    fn receive_failures() {
        assert_eq!(
            response_for_status(ShareStatus::StorageFull),
            ResponseCode::DATABASE_FULL
        );
        assert_eq!(
            response_for_status(ShareStatus::FileError),
            ResponseCode::INTERNAL_ERROR
        );
    }
}
